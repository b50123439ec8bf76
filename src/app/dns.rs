//! DNS hook logic
//!
//! Translates observed answers into record-store updates and IP-set
//! insertions for every group whose rules match, synthesises NXDOMAIN for
//! PTR probes, strips AAAA answers and optionally attaches an EDNS client
//! subnet option.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use hickory_proto::op::{Edns, Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsOption};
use hickory_proto::rr::{RData, Record, RecordType};
use tracing::{debug, error, trace};

use crate::app::App;
use crate::dns::{DnsInterceptor, RequestAction, Transport};
use crate::error::DnsError;

/// ECS scope announced for IPv4 clients
const ECS_V4_PREFIX: u8 = 24;

/// ECS scope announced for IPv6 clients
const ECS_V6_PREFIX: u8 = 56;

#[async_trait]
impl DnsInterceptor for App {
    async fn on_request(
        &self,
        client: SocketAddr,
        req: &Message,
        transport: Transport,
    ) -> Result<RequestAction, DnsError> {
        let settings = self.settings();

        for q in req.queries() {
            trace!(
                name = %q.name(),
                qtype = %q.query_type(),
                client = %client,
                %transport,
                "requested record",
            );
        }

        // Some firmwares flood the resolver with reverse lookups for every
        // LAN peer; answering locally keeps them off the upstream.
        if !settings.dns_proxy.disable_fake_ptr
            && req.queries().len() == 1
            && req.queries()[0].query_type() == RecordType::PTR
        {
            return Ok(RequestAction::Respond(nxdomain_for(req)));
        }

        if settings.dns_proxy.enable_ecs {
            if let Some(modified) = with_client_subnet(req, client.ip()) {
                return Ok(RequestAction::Replace(modified));
            }
        }

        Ok(RequestAction::Forward)
    }

    async fn on_response(
        &self,
        client: SocketAddr,
        _req: &Message,
        mut resp: Message,
        transport: Transport,
    ) -> Result<Option<Message>, DnsError> {
        let settings = self.settings();

        // Observe all answers before any filtering
        self.handle_answers(&resp, client, transport).await;

        if !settings.dns_proxy.disable_drop_aaaa {
            let answers = resp.take_answers();
            let filtered: Vec<Record> = answers
                .into_iter()
                .filter(|r| r.record_type() != RecordType::AAAA)
                .collect();
            resp.insert_answers(filtered);
        }

        Ok(Some(resp))
    }
}

impl App {
    /// Deferred answer pass: update the record store and the matching
    /// groups' IP sets
    async fn handle_answers(&self, msg: &Message, client: SocketAddr, transport: Transport) {
        for record in msg.answers() {
            match record.data() {
                Some(RData::A(a)) => {
                    self.process_a_record(record, IpAddr::V4(a.0), client, transport)
                        .await;
                }
                Some(RData::CNAME(target)) => {
                    self.process_cname_record(record, &target.0.to_string(), client, transport)
                        .await;
                }
                _ => {}
            }
        }
    }

    async fn process_a_record(
        &self,
        record: &Record,
        address: IpAddr,
        client: SocketAddr,
        transport: Transport,
    ) {
        let name = strip_dot(&record.name().to_string());
        let ttl = record
            .ttl()
            .saturating_add(self.settings().netfilter.additional_ttl);
        trace!(
            name = %name,
            address = %address,
            ttl = record.ttl(),
            client = %client,
            %transport,
            "processing a record",
        );

        self.records().add_a_record(&name, address, ttl);

        let aliases = self.records().get_aliases(&name);
        for group in self.groups() {
            'rules: for rule in group.model().rules {
                if !rule.is_enabled() {
                    continue;
                }
                for alias in &aliases {
                    if !rule.is_match(alias) {
                        continue;
                    }
                    match group.add_ip(address, ttl).await {
                        Ok(()) => debug!(
                            address = %address,
                            domain = %name,
                            alias = %alias,
                            group = %group.id(),
                            "add address",
                        ),
                        Err(e) => error!(address = %address, error = %e, "failed to add address"),
                    }
                    // First matching alias settles this group
                    break 'rules;
                }
            }
        }
    }

    async fn process_cname_record(
        &self,
        record: &Record,
        target: &str,
        client: SocketAddr,
        transport: Transport,
    ) {
        let name = strip_dot(&record.name().to_string());
        let target = strip_dot(target);
        let ttl = record
            .ttl()
            .saturating_add(self.settings().netfilter.additional_ttl);
        trace!(
            name = %name,
            cname = %target,
            ttl = record.ttl(),
            client = %client,
            %transport,
            "processing cname record",
        );

        self.records().add_cname_record(&name, &target, ttl);

        // The chain's head may already have cached A records
        let now = std::time::Instant::now();
        let a_records = self.records().get_a_records(&name);
        let aliases = self.records().get_aliases(&name);

        for group in self.groups() {
            'rules: for rule in group.model().rules {
                if !rule.is_enabled() {
                    continue;
                }
                for alias in &aliases {
                    if !rule.is_match(alias) {
                        continue;
                    }
                    for a_record in &a_records {
                        let remaining = a_record.remaining_ttl(now);
                        match group.add_ip(a_record.address, remaining).await {
                            Ok(()) => debug!(
                                address = %a_record.address,
                                alias = %alias,
                                group = %group.id(),
                                "add address",
                            ),
                            Err(e) => {
                                error!(address = %a_record.address, error = %e, "failed to add address");
                            }
                        }
                    }
                    continue 'rules;
                }
            }
        }
    }
}

fn strip_dot(name: &str) -> String {
    name.trim_end_matches('.').to_string()
}

/// Synthesise a local NXDOMAIN answer for `req`
fn nxdomain_for(req: &Message) -> Message {
    let mut resp = Message::new();
    resp.set_id(req.id());
    resp.set_message_type(MessageType::Response);
    resp.set_recursion_available(true);
    resp.set_response_code(ResponseCode::NXDomain);
    for q in req.queries() {
        resp.add_query(q.clone());
    }
    resp
}

/// Clone `req` with an EDNS client-subnet option for `client`
///
/// Returns `None` for clients whose address carries no routable subnet
/// information (loopback / unspecified).
fn with_client_subnet(req: &Message, client: IpAddr) -> Option<Message> {
    if client.is_loopback() || client.is_unspecified() {
        return None;
    }
    let prefix = match client {
        IpAddr::V4(_) => ECS_V4_PREFIX,
        IpAddr::V6(_) => ECS_V6_PREFIX,
    };

    let mut modified = req.clone();
    let mut edns = match modified.extensions() {
        Some(edns) => edns.clone(),
        None => Edns::new(),
    };
    edns.options_mut()
        .insert(EdnsOption::Subnet(ClientSubnet::new(client, prefix, 0)));
    *modified.extensions_mut() = Some(edns);
    Some(modified)
}
