use crate::i2np::I2npMessage;
use crate::lease::LeaseSet;
#[cfg(test)] use mockall::automock;

/// End-to-end encryption towards a remote destination. Wrapping may bundle the local
///  lease set into the envelope so the peer learns our current inbound tunnels.
#[cfg_attr(test, automock)]
pub trait Garlic: Send + Sync + 'static {
    fn wrap_message(
        &self,
        remote: &LeaseSet,
        msg: I2npMessage,
        bundled_lease_set: Option<I2npMessage>,
    ) -> I2npMessage;
}
