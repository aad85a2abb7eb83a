//! Inbound FIND_NODE handling

use crate::service::DhtService;
use peerlink_network::{ProtocolHandler, Result, Stream};
use peerlink_protocol::{read_frame, write_frame, Address, DhtRequest, DHT_PROTOCOL};
use tracing::debug;

/// Answers FIND_NODE requests from the local routing table
pub struct DhtRequestHandler {
    service: DhtService,
}

impl DhtRequestHandler {
    pub fn new(service: DhtService) -> Self {
        DhtRequestHandler { service }
    }
}

#[async_trait::async_trait]
impl ProtocolHandler for DhtRequestHandler {
    fn protocol_id(&self) -> &'static str {
        DHT_PROTOCOL
    }

    async fn handle(&self, mut stream: Stream) -> Result<()> {
        let remote = stream.remote_peer();
        let observed_ip = stream
            .remote_addr()
            .and_then(Address::socket_addr)
            .map(|addr| addr.ip());
        let request: DhtRequest = read_frame(&mut stream).await?;

        let response = self.service.handle_find_node(&request.target, &remote).await;
        write_frame(&mut stream, &response).await?;
        stream.close().await?;

        // the requester is only trusted for its own entry
        match request.sender {
            Some(mut sender) if sender.peer_id == remote => {
                // a wildcard listen address is only dialable at the IP we saw
                match observed_ip {
                    Some(ip) => {
                        sender.resolve_unspecified(ip);
                    }
                    None => sender.addresses.retain(|a| !a.is_unspecified()),
                }
                self.service.insert_peer(sender).await;
            }
            Some(sender) => {
                debug!("{} advertised foreign sender {}; ignored", remote, sender.peer_id);
            }
            None => {}
        }

        Ok(())
    }
}
