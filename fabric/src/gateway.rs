//! The gateway: aggregation of services announced by remote cluster nodes.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::LocatorError;
use crate::resolve::ResolveInfo;

/// The capability set the locator requires from a gateway.
///
/// The locator feeds remote announces into `consume`/`cleanup` and asks
/// `resolve` for services it does not provide locally. Selection policy is
/// up to the implementation.
pub trait Gateway: Send + Sync + std::fmt::Debug + 'static {
    /// Pick a provider for the named service.
    fn resolve(&self, name: &str) -> Result<ResolveInfo, LocatorError>;

    /// Add or replace the provider announced by `uuid` for `name`.
    fn consume(&self, uuid: &str, name: &str, info: ResolveInfo);

    /// Remove the provider announced by `uuid` for `name`.
    fn cleanup(&self, uuid: &str, name: &str);
}

#[derive(Debug, Default)]
struct Providers {
    entries: Vec<(String, ResolveInfo)>,
    cursor: usize,
}

/// A gateway cycling through the known providers of each service.
#[derive(Debug, Default)]
pub struct RoundRobin {
    services: Mutex<HashMap<String, Providers>>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Gateway for RoundRobin {
    fn resolve(&self, name: &str) -> Result<ResolveInfo, LocatorError> {
        let mut services = self.services.lock().expect("provider table poisoned");
        let providers = services.get_mut(name).ok_or(LocatorError::ServiceNotAvailable)?;
        if providers.entries.is_empty() {
            return Err(LocatorError::ServiceNotAvailable);
        }
        providers.cursor = (providers.cursor + 1) % providers.entries.len();
        let (uuid, info) = &providers.entries[providers.cursor];
        tracing::debug!(service = name, uuid = %uuid, "resolved through a remote provider");
        Ok(info.clone())
    }

    fn consume(&self, uuid: &str, name: &str, info: ResolveInfo) {
        let mut services = self.services.lock().expect("provider table poisoned");
        let providers = services.entry(name.to_string()).or_default();
        match providers.entries.iter_mut().find(|(owner, _)| owner == uuid) {
            Some((_, slot)) => *slot = info,
            None => providers.entries.push((uuid.to_string(), info)),
        }
    }

    fn cleanup(&self, uuid: &str, name: &str) {
        let mut services = self.services.lock().expect("provider table poisoned");
        if let Some(providers) = services.get_mut(name) {
            providers.entries.retain(|(owner, _)| owner != uuid);
            if providers.entries.is_empty() {
                services.remove(name);
            }
        }
    }
}
