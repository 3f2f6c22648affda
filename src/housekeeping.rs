use crate::{api::AppState, auth};
use tokio::time::{interval, Duration};

/// Periodically remove expired verification and reset tokens.
pub fn run_housekeeping(state: AppState) {
    tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(300));
        loop {
            tick.tick().await;
            let purged = state
                .pool
                .get()
                .ok()
                .and_then(|conn| auth::purge_expired_tokens(&conn).ok())
                .unwrap_or(0);
            if purged > 0 {
                tracing::info!(purged, "expired account tokens removed");
            }
        }
    });
}
