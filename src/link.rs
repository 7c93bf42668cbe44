//! Command half of the sensor transport.
//!
//! The supervisors never talk to a radio directly. They issue
//! [`LinkCommand`]s through a [`DeviceLink`]; whatever owns the other end
//! (the simulator, or an external bridge polling over HTTP) carries them out
//! and reports the resulting connection states back to the supervisor.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::model::{ConnectionErrorKind, DeviceRole};

/// A request for the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum LinkCommand {
    Connect { address: String },
    Disconnect { address: String },
}

/// Something that can open and close a device link.
pub trait DeviceLink: Send + Sync {
    /// Ask the transport to connect and subscribe. Progress is reported
    /// asynchronously through connection-state updates.
    fn connect(&self, address: &str) -> Result<(), ConnectionErrorKind>;

    /// Ask the transport to drop the link.
    fn disconnect(&self, address: &str);
}

/// [`DeviceLink`] that queues commands on an unbounded channel.
pub struct ChannelLink {
    role: DeviceRole,
    tx: mpsc::UnboundedSender<LinkCommand>,
}

impl ChannelLink {
    pub fn new(role: DeviceRole) -> (Self, mpsc::UnboundedReceiver<LinkCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { role, tx }, rx)
    }
}

impl DeviceLink for ChannelLink {
    fn connect(&self, address: &str) -> Result<(), ConnectionErrorKind> {
        debug!(role = %self.role, address, "Queueing connect command");
        self.tx
            .send(LinkCommand::Connect {
                address: address.to_string(),
            })
            .map_err(|_| {
                warn!(role = %self.role, "Transport bridge is gone");
                ConnectionErrorKind::Ble
            })
    }

    fn disconnect(&self, address: &str) {
        debug!(role = %self.role, address, "Queueing disconnect command");
        if self
            .tx
            .send(LinkCommand::Disconnect {
                address: address.to_string(),
            })
            .is_err()
        {
            warn!(role = %self.role, "Transport bridge is gone, disconnect dropped");
        }
    }
}
