//! Record shapes for each deploy style.
//!
//! Both styles key resources by the same `type/name` paths, so a diff of two
//! documents reads the same either way. They differ in the folder resources
//! are placed in and in the fields of each record.

use crate::{members::Member, names};
use bigip_gateway_controller_core::{ConfigDoc, DeployStyle, Record};
use serde_json::{json, Value};
use std::net::IpAddr;

/// A virtual server for one listener on one gateway address.
#[derive(Clone, Debug)]
pub struct VirtualServer {
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
    /// The client-ssl profile of an HTTPS listener with certificates.
    pub client_ssl: Option<String>,
    pub rules: Vec<String>,
}

/// A listener certificate taken from a TLS Secret.
#[derive(Clone, Debug)]
pub struct Certificate {
    pub name: String,
    pub cert: String,
    pub key: String,
}

pub trait Shape: Send + Sync {
    fn folder(&self) -> &'static str;

    fn rule(&self, doc: &mut ConfigDoc, name: &str, text: String);

    fn virtual_server(&self, doc: &mut ConfigDoc, vs: &VirtualServer);

    fn certificate(&self, doc: &mut ConfigDoc, cert: &Certificate);

    fn client_ssl(&self, doc: &mut ConfigDoc, name: &str, certs: &[String]);

    fn pool(&self, doc: &mut ConfigDoc, name: &str, members: &[Member]);

    /// Static ARP and node entries for a member reached over an overlay.
    fn overlay_member(&self, doc: &mut ConfigDoc, address: IpAddr, mac: &str);
}

pub fn for_style(style: DeployStyle) -> &'static dyn Shape {
    match style {
        DeployStyle::Rest => &Rest,
        DeployStyle::As3 => &As3,
    }
}

#[derive(Debug)]
struct Rest;

#[derive(Debug)]
struct As3;

const UPLOADS: &str = "file:/var/config/rest/downloads";

// === impl Rest ===

impl Shape for Rest {
    fn folder(&self) -> &'static str {
        ""
    }

    fn rule(&self, doc: &mut ConfigDoc, name: &str, text: String) {
        doc.insert(
            self.folder(),
            names::path("ltm/rule", name),
            record(json!({ "name": name, "apiAnonymous": text })),
        );
    }

    fn virtual_server(&self, doc: &mut ConfigDoc, vs: &VirtualServer) {
        let mut profiles = vec![json!({ "name": "http" })];
        if let Some(client_ssl) = vs.client_ssl.as_deref() {
            profiles.push(json!({ "name": client_ssl, "context": "clientside" }));
        }
        doc.insert(
            self.folder(),
            names::path("ltm/virtual", &vs.name),
            record(json!({
                "name": vs.name,
                "destination": names::destination(vs.address, vs.port),
                "ipProtocol": "tcp",
                "profiles": profiles,
                "sourceAddressTranslation": { "type": "automap" },
                "rules": vs.rules,
            })),
        );
    }

    fn certificate(&self, doc: &mut ConfigDoc, cert: &Certificate) {
        let crt = format!("{}.crt", cert.name);
        let key = format!("{}.key", cert.name);
        doc.insert(
            self.folder(),
            names::path("shared/file-transfer/uploads", &crt),
            record(json!({ "name": crt, "content": cert.cert })),
        );
        doc.insert(
            self.folder(),
            names::path("shared/file-transfer/uploads", &key),
            record(json!({ "name": key, "content": cert.key })),
        );
        doc.insert(
            self.folder(),
            names::path("sys/file/ssl-cert", &crt),
            record(json!({ "name": crt, "sourcePath": format!("{UPLOADS}/{crt}") })),
        );
        doc.insert(
            self.folder(),
            names::path("sys/file/ssl-key", &key),
            record(json!({ "name": key, "sourcePath": format!("{UPLOADS}/{key}") })),
        );
    }

    fn client_ssl(&self, doc: &mut ConfigDoc, name: &str, certs: &[String]) {
        let chain = certs
            .iter()
            .map(|cert| {
                json!({
                    "name": cert,
                    "cert": format!("{cert}.crt"),
                    "key": format!("{cert}.key"),
                })
            })
            .collect::<Vec<_>>();
        doc.insert(
            self.folder(),
            names::path("ltm/profile/client-ssl", name),
            record(json!({
                "name": name,
                "defaultsFrom": "/Common/clientssl",
                "certKeyChain": chain,
            })),
        );
    }

    fn pool(&self, doc: &mut ConfigDoc, name: &str, members: &[Member]) {
        let members = members
            .iter()
            .map(|m| {
                json!({
                    "name": names::destination(m.address, m.port),
                    "address": m.address.to_string(),
                })
            })
            .collect::<Vec<_>>();
        doc.insert(
            self.folder(),
            names::path("ltm/pool", name),
            record(json!({
                "name": name,
                "monitor": "min 1 of tcp",
                "members": members,
            })),
        );
    }

    fn overlay_member(&self, doc: &mut ConfigDoc, address: IpAddr, mac: &str) {
        let arp = names::arp(address);
        let ip = address.to_string();
        doc.insert(
            self.folder(),
            names::path("net/arp", &arp),
            record(json!({ "name": arp, "ipAddress": ip, "macAddress": mac })),
        );
        doc.insert(
            self.folder(),
            names::path("ltm/node", &ip),
            record(json!({
                "name": ip,
                "address": ip,
                "monitor": "default",
                "session": "user-enabled",
            })),
        );
    }
}

// === impl As3 ===

impl Shape for As3 {
    fn folder(&self) -> &'static str {
        names::AS3_FOLDER
    }

    fn rule(&self, doc: &mut ConfigDoc, name: &str, text: String) {
        doc.insert(
            self.folder(),
            names::path("ltm/rule", name),
            record(json!({ "class": "iRule", "iRule": text })),
        );
    }

    fn virtual_server(&self, doc: &mut ConfigDoc, vs: &VirtualServer) {
        let mut virtual_server = record(json!({
            "class": "Service_HTTP",
            "profileHTTP": "basic",
            "virtualAddresses": [vs.address.to_string()],
            "virtualPort": vs.port,
            "iRules": vs.rules,
            "snat": "auto",
        }));
        if let Some(client_ssl) = vs.client_ssl.as_deref() {
            virtual_server.insert("class".into(), "Service_HTTPS".into());
            virtual_server.insert("serverTLS".into(), client_ssl.into());
        }
        doc.insert(
            self.folder(),
            names::path("ltm/virtual", &vs.name),
            virtual_server,
        );
    }

    fn certificate(&self, doc: &mut ConfigDoc, cert: &Certificate) {
        doc.insert(
            self.folder(),
            names::path("sys/file/certificate", &cert.name),
            record(json!({
                "class": "Certificate",
                "certificate": cert.cert,
                "privateKey": cert.key,
            })),
        );
    }

    fn client_ssl(&self, doc: &mut ConfigDoc, name: &str, certs: &[String]) {
        let certificates = certs
            .iter()
            .map(|cert| json!({ "certificate": cert }))
            .collect::<Vec<_>>();
        doc.insert(
            self.folder(),
            names::path("ltm/profile/client-ssl", name),
            record(json!({ "class": "TLS_Server", "certificates": certificates })),
        );
    }

    fn pool(&self, doc: &mut ConfigDoc, name: &str, members: &[Member]) {
        let members = members
            .iter()
            .map(|m| {
                json!({
                    "servicePort": m.port,
                    "serverAddresses": [m.address.to_string()],
                })
            })
            .collect::<Vec<_>>();
        doc.insert(
            self.folder(),
            names::path("ltm/pool", name),
            record(json!({
                "class": "Pool",
                "monitors": ["tcp"],
                "members": members,
            })),
        );
    }

    // Declarations do not manage ARP or node entries.
    fn overlay_member(&self, _: &mut ConfigDoc, _: IpAddr, _: &str) {}
}

fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}
