//! Per-request dispatch: decode, local lookup, forward on miss, and a
//! well-formed DNS error response for every failure mode.

use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info};

use crate::errors::DnsError;
use crate::metrics::{
    DNS_REQUESTS_TOTAL, DNS_RESPONSES_TOTAL, STORE_HITS_TOTAL, STORE_MISSES_TOTAL,
    UPSTREAM_FAILURES_TOTAL, UPSTREAM_REQUEST_DURATION,
};
use crate::packet::{DnsPacket, ResponseCode, PACKET_SIZE};
use crate::store::RecordStore;
use crate::upstream::Forwarder;

/// The per-request state machine. Stateless between requests: everything it
/// needs lives in the shared record store and the optional upstream seam.
pub struct Resolver {
    store: Arc<RecordStore>,
    upstream: Option<Arc<dyn Forwarder>>,
}

impl Resolver {
    pub fn new(store: Arc<RecordStore>, upstream: Option<Arc<dyn Forwarder>>) -> Self {
        Self { store, upstream }
    }

    pub fn has_upstream(&self) -> bool {
        self.upstream.is_some()
    }

    /// Turns one received datagram into one response datagram. Never fails
    /// and never panics: malformed input gets a FORMERR reply, everything
    /// else that goes wrong gets a SERVFAIL reply.
    pub async fn handle_request(&self, request_raw: &[u8; PACKET_SIZE]) -> [u8; PACKET_SIZE] {
        DNS_REQUESTS_TOTAL.inc();
        let response = self.triage(request_raw).await;
        let rcode = ResponseCode::from_num(response[3] & 0x0f);
        DNS_RESPONSES_TOTAL.with_label_values(&[rcode.as_str()]).inc();
        response
    }

    async fn triage(&self, request_raw: &[u8; PACKET_SIZE]) -> [u8; PACKET_SIZE] {
        let request = match DnsPacket::from_bytes(request_raw) {
            Ok(request) => request,
            Err(e) => {
                let id = DnsPacket::id_only(request_raw);
                info!("Failed to decode request (TxID: {:#06x}): {}", id, e);
                return self.encode_or_minimal(self.response_template(id, ResponseCode::FORMERR));
            }
        };

        let mut response = self.lookup(&request);
        if response.is_err() && request.header.recursion_desired {
            response = self.forward(&request).await;
        }

        match response {
            Ok(response) => self.encode_or_minimal(response),
            Err(e) => {
                error!(
                    "Returning SERVFAIL response (TxID: {:#06x}): {}",
                    request.header.id, e
                );
                self.encode_or_minimal(
                    self.response_template(request.header.id, ResponseCode::SERVFAIL),
                )
            }
        }
    }

    fn lookup(&self, request: &DnsPacket) -> Result<DnsPacket, DnsError> {
        if request.questions.len() != 1 {
            info!(
                "Request {:#06x} carried {} questions, answering FORMERR.",
                request.header.id,
                request.questions.len()
            );
            return Ok(self.response_template(request.header.id, ResponseCode::FORMERR));
        }

        let question = &request.questions[0];
        let answers = self.store.query(question);
        if answers.is_empty() {
            STORE_MISSES_TOTAL.inc();
            return Err(DnsError::NotFound(format!(
                "no records found for qname: {}",
                question.qname
            )));
        }
        STORE_HITS_TOTAL.inc();

        let mut response = self.response_template(request.header.id, ResponseCode::NOERROR);
        response.questions = request.questions.clone();
        response.answers = answers;
        info!("Returning response: {}", response);
        Ok(response)
    }

    async fn forward(&self, request: &DnsPacket) -> Result<DnsPacket, DnsError> {
        let Some(upstream) = &self.upstream else {
            return Err(DnsError::UpstreamUnavailable(
                "no upstream resolver is configured".to_string(),
            ));
        };

        info!(
            "Forwarding request {:#06x} to the upstream resolver.",
            request.header.id
        );
        let request_raw = request.to_bytes()?;
        let start = Instant::now();
        let response_raw = match upstream.call(&request_raw).await {
            Ok(bytes) => bytes,
            Err(e) => {
                UPSTREAM_FAILURES_TOTAL.inc();
                return Err(DnsError::UpstreamUnavailable(format!(
                    "forwarded exchange failed: {e:#}"
                )));
            }
        };
        UPSTREAM_REQUEST_DURATION.observe(start.elapsed().as_secs_f64());

        let mut response = DnsPacket::from_bytes(&response_raw)?;
        for record in &response.answers {
            self.store.insert_or_update(record.clone());
        }
        // The dispatcher owns the transaction id on the client-facing side.
        response.header.id = request.header.id;
        Ok(response)
    }

    fn response_template(&self, id: u16, response_code: ResponseCode) -> DnsPacket {
        let mut response = DnsPacket::default();
        response.header.id = id;
        response.header.response_code = response_code;
        response.header.query_response = true;
        response.header.recursion_available = self.upstream.is_some();
        response
    }

    /// Encoding a response can only fail on buffer overflow. Fall back to a
    /// bare SERVFAIL header rather than dropping the datagram.
    fn encode_or_minimal(&self, response: DnsPacket) -> [u8; PACKET_SIZE] {
        match response.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(
                    "Failed to encode response (TxID: {:#06x}): {}",
                    response.header.id, e
                );
                let mut bytes = [0u8; PACKET_SIZE];
                bytes[0] = (response.header.id >> 8) as u8;
                bytes[1] = response.header.id as u8;
                bytes[2] = 0x80;
                bytes[3] = ResponseCode::SERVFAIL.to_num();
                bytes
            }
        }
    }
}
