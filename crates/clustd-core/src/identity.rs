//! Local identity.

use std::fmt;

use zeroize::Zeroizing;

/// Who this process is, plus the cluster's shared pre-key.
///
/// The secret is never transmitted or logged; `Debug` redacts it and the
/// buffer is wiped on drop.
#[derive(Clone)]
pub struct LocalIdentity {
    secret: Zeroizing<Vec<u8>>,
    id: String,
    remote_address: String,
}

impl LocalIdentity {
    /// Create an identity.
    ///
    /// `remote_address` is the address peers should use to reach this
    /// process. A machine whose host equals it is the local machine.
    pub fn new(
        secret: impl Into<Vec<u8>>,
        id: impl Into<String>,
        remote_address: impl Into<String>,
    ) -> Self {
        Self {
            secret: Zeroizing::new(secret.into()),
            id: id.into(),
            remote_address: remote_address.into(),
        }
    }

    /// Shared pre-key bytes.
    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    /// Node id announced in handshakes.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Address announced in handshakes.
    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("id", &self.id)
            .field("remote_address", &self.remote_address)
            .finish_non_exhaustive()
    }
}
