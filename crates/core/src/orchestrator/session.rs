//! Scoped provider sessions.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::source::{DataSource, SessionHandle, SourceError};

/// Close bound used when a worker is not given one.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// An open provider session that is closed on every exit path.
///
/// Prefer [`SessionGuard::close`]. If the guard is dropped instead (an
/// early return or an aborted task), the close is spawned onto the runtime.
/// Either way the close is abandoned after `close_timeout`.
pub struct SessionGuard {
    source: Arc<dyn DataSource>,
    handle: SessionHandle,
    close_timeout: Duration,
    closed: bool,
}

impl SessionGuard {
    pub async fn open(
        source: Arc<dyn DataSource>,
        race_id: &str,
        close_timeout: Duration,
    ) -> Result<Self, SourceError> {
        let handle = source.open_session(race_id).await?;
        debug!(race_id = %race_id, session_id = %handle.id, "Session opened");
        Ok(Self {
            source,
            handle,
            close_timeout,
            closed: false,
        })
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub async fn close(mut self) {
        self.closed = true;
        close_quietly(self.source.as_ref(), &self.handle, self.close_timeout).await;
    }
}

async fn close_quietly(source: &dyn DataSource, handle: &SessionHandle, limit: Duration) {
    match tokio::time::timeout(limit, source.close_session(handle)).await {
        Ok(Ok(())) => debug!(race_id = %handle.race_id, session_id = %handle.id, "Session closed"),
        Ok(Err(e)) => warn!(
            race_id = %handle.race_id,
            session_id = %handle.id,
            error = %e,
            "Failed to close session"
        ),
        Err(_) => warn!(
            race_id = %handle.race_id,
            session_id = %handle.id,
            timeout_ms = limit.as_millis() as u64,
            "Session close timed out, abandoning it"
        ),
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let source = Arc::clone(&self.source);
        let handle = self.handle.clone();
        let limit = self.close_timeout;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    close_quietly(source.as_ref(), &handle, limit).await;
                });
            }
            Err(_) => warn!(
                race_id = %handle.race_id,
                session_id = %handle.id,
                "Session dropped outside a runtime, not closed"
            ),
        }
    }
}
