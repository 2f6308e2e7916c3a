//! Multiplexed executor (C13): a variant of C2 where each work item carries
//! a `storage_profile` discriminator, routed to the correct backend client
//! via a `MuxClientProvider`.
//!
//! Grounded on spec §4.12; all other semantics match `executor::run_job`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::{ErrorKind, OsmoError, OsmoResult};

/// Produces a per-profile client lazily, caching the result.
pub trait MuxStorageClientFactory<Client>: Send + Sync {
    fn build(&self, profile: &str) -> OsmoResult<Client>;
}

/// Binds a logical work item to the correct client via `bind(profile)`
/// inside each worker closure, without every worker needing to know how
/// clients are constructed.
pub struct MuxClientProvider<Client> {
    clients: HashMap<String, Arc<Client>>,
}

impl<Client> MuxClientProvider<Client> {
    pub fn build(
        profiles: &[&str],
        factory: &dyn MuxStorageClientFactory<Client>,
    ) -> OsmoResult<Self> {
        let mut clients = HashMap::new();
        for profile in profiles {
            clients.insert(profile.to_string(), Arc::new(factory.build(profile)?));
        }
        Ok(MuxClientProvider { clients })
    }

    pub fn bind(&self, profile: &str) -> OsmoResult<Arc<Client>> {
        self.clients
            .get(profile)
            .cloned()
            .ok_or_else(|| OsmoError::new(ErrorKind::Server, format!("no client bound for storage profile `{profile}`")))
    }
}

/// A work item routed by the multiplexed executor.
pub trait MuxWorkItem: super::WorkItem {
    fn storage_profile(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeClient {
        profile: String,
    }

    struct FakeFactory;
    impl MuxStorageClientFactory<FakeClient> for FakeFactory {
        fn build(&self, profile: &str) -> OsmoResult<FakeClient> {
            Ok(FakeClient { profile: profile.to_string() })
        }
    }

    #[test]
    fn bind_returns_the_client_built_for_that_profile() {
        let provider = MuxClientProvider::build(&["backend-a", "backend-b"], &FakeFactory).unwrap();
        let client = provider.bind("backend-b").unwrap();
        assert_eq!(client.profile, "backend-b");
    }

    #[test]
    fn bind_on_unknown_profile_is_a_server_error() {
        let provider = MuxClientProvider::build(&["backend-a"], &FakeFactory).unwrap();
        let err = provider.bind("backend-z").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Server);
    }
}
