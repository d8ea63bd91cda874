//! Identity collaborator: who is signed in, and signing out.

use crate::error::Result;
use crate::types::CurrentUser;
use parking_lot::RwLock;

pub trait IdentityProvider: Send + Sync {
    /// The signed-in user, if any.
    fn current_user(&self) -> Option<CurrentUser>;

    fn sign_out(&self) -> Result<()>;
}

/// Identity held in memory; useful for embedding and tests.
#[derive(Default)]
pub struct StaticIdentity {
    user: RwLock<Option<CurrentUser>>,
}

impl StaticIdentity {
    pub fn signed_in(user: CurrentUser) -> Self {
        Self {
            user: RwLock::new(Some(user)),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn sign_in(&self, user: CurrentUser) {
        *self.user.write() = Some(user);
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user(&self) -> Option<CurrentUser> {
        self.user.read().clone()
    }

    fn sign_out(&self) -> Result<()> {
        self.user.write().take();
        Ok(())
    }
}
