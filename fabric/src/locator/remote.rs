//! The outbound side of cluster synchronization: the link to one remote
//! node and the session pumping its announces back into the locator.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::locator::ConnectUpdate;
use crate::locator::LocatorMsg;
use crate::rpc::Client;
use crate::rpc::Connector;
use crate::rpc::Incoming;

/// The locator's view of one linked remote node.
pub(crate) struct RemoteSession {
    pub(crate) client: Client,
    pub(crate) endpoint: SocketAddr,
    /// Services currently announced by the peer. Drives gateway cleanup
    /// when the session is torn down.
    pub(crate) active: HashSet<String>,
}

/// Connect to one of the peer's locator endpoints in order, open the
/// `connect` stream under our own uuid, and feed every announce back into
/// the locator mailbox until the stream ends.
pub(crate) async fn run(
    uuid: String,
    endpoints: Vec<SocketAddr>,
    self_uuid: String,
    connector: Arc<dyn Connector>,
    tx: mpsc::UnboundedSender<LocatorMsg>,
) {
    let mut connected = None;
    for endpoint in &endpoints {
        match connector.connect(*endpoint).await {
            Ok(transport) => {
                tracing::debug!(uuid = %uuid, %endpoint, "connected to remote node");
                connected = Some((Client::attach(*endpoint, transport), *endpoint));
                break;
            }
            Err(error) => {
                tracing::debug!(uuid = %uuid, %endpoint, %error, "endpoint is unreachable, trying the next one");
            }
        }
    }
    let (client, endpoint) = match connected {
        Some(connected) => connected,
        None => {
            tracing::error!(uuid = %uuid, "unable to connect to a remote node");
            return;
        }
    };

    let mut upstream = match client.call("connect", &(self_uuid,)) {
        Ok(upstream) => upstream,
        Err(error) => {
            tracing::error!(uuid = %uuid, %error, "unable to open a synchronization stream");
            return;
        }
    };
    if tx
        .send(LocatorMsg::LinkEstablished {
            uuid: uuid.clone(),
            client,
            endpoint,
        })
        .is_err()
    {
        return;
    }

    loop {
        match upstream.recv().await {
            Some(Incoming::Chunk(value)) => match serde_json::from_value::<ConnectUpdate>(value) {
                Ok(update) => {
                    if tx
                        .send(LocatorMsg::Announce {
                            uuid: uuid.clone(),
                            update,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                Err(error) => {
                    tracing::error!(uuid = %uuid, %error, "malformed announce from remote node");
                    break;
                }
            },
            Some(Incoming::Error { code, message }) => {
                tracing::error!(uuid = %uuid, code, %message, "synchronization stream failed");
                break;
            }
            Some(Incoming::Choke) | None => {
                tracing::info!(uuid = %uuid, "remote node closed synchronization stream");
                break;
            }
        }
    }
    let _ = tx.send(LocatorMsg::SessionEnded { uuid });
}
