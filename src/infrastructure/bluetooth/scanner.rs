//! BLE Scanner Module
//!
//! Finds the target peripheral by its advertised name.

use crate::domain::models::{Advertisement, PeripheralIdentity};
use crate::infrastructure::bluetooth::error::TransportError;
use crate::infrastructure::bluetooth::transport::Transport;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Scan filter over a borrowed transport
pub struct BleScanner<'a, T: Transport> {
    transport: &'a T,
}

impl<'a, T: Transport> BleScanner<'a, T> {
    pub fn new(transport: &'a T) -> Self {
        Self { transport }
    }

    /// Scan until an advertisement named exactly `target_name` arrives or
    /// `timeout` elapses.
    ///
    /// The scan is stopped exactly once before this returns, whatever the
    /// outcome. `Ok(None)` means nothing matched in time.
    pub async fn find(
        &self,
        target_name: &str,
        timeout: Duration,
    ) -> Result<Option<PeripheralIdentity>, TransportError> {
        info!(target = target_name, ?timeout, "Starting BLE scan");
        let mut advertisements = self.transport.start_scan().await?;

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                _ = &mut deadline => {
                    info!(target = target_name, "Scan timed out without a match");
                    break Ok(None);
                }
                next = advertisements.next() => match next {
                    Some(Ok(advertisement)) => {
                        if let Some(identity) = matching(&advertisement, target_name) {
                            info!(peripheral = %identity, "Found target peripheral");
                            break Ok(Some(identity));
                        }
                        trace!(?advertisement, "Ignoring advertisement");
                    }
                    Some(Err(e)) => {
                        warn!("Scan aborted by transport: {}", e);
                        break Err(e);
                    }
                    None => {
                        debug!("Advertisement stream ended");
                        break Ok(None);
                    }
                },
            }
        };
        drop(advertisements);

        self.stop().await;
        outcome
    }

    /// Collect every distinct advertisement seen during `duration`.
    pub async fn survey(&self, duration: Duration) -> Result<Vec<Advertisement>, TransportError> {
        info!(?duration, "Surveying nearby peripherals");
        let mut advertisements = self.transport.start_scan().await?;
        let mut seen: HashMap<_, Advertisement> = HashMap::new();

        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                _ = &mut deadline => break Ok(()),
                next = advertisements.next() => match next {
                    Some(Ok(advertisement)) => {
                        seen.insert(advertisement.id.clone(), advertisement);
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Ok(()),
                },
            }
        };
        drop(advertisements);

        self.stop().await;
        outcome?;

        let mut devices: Vec<_> = seen.into_values().collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(devices)
    }

    async fn stop(&self) {
        if let Err(e) = self.transport.stop_scan().await {
            warn!("Failed to stop scan cleanly: {}", e);
        }
    }
}

fn matching(advertisement: &Advertisement, target_name: &str) -> Option<PeripheralIdentity> {
    match advertisement.name.as_deref() {
        Some(name) if name == target_name => Some(PeripheralIdentity {
            id: advertisement.id.clone(),
            name: name.to_string(),
        }),
        _ => None,
    }
}
