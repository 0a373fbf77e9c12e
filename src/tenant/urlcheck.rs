// ── Airborne Tenant: Base-URL Safety Check ─────────────────────────────────
// Guard for any client-supplied base_url. Rejects anything that could turn
// the gateway into a proxy against itself or its network:
//
//   • non-absolute URLs and non-http(s) schemes (file, gopher, ftp,
//     javascript, data, …)
//   • literal loopback, link-local, private, and unspecified addresses,
//     including the cloud-metadata address 169.254.169.254
//   • hostnames that *resolve* to any such address (DNS-rebinding guard)
//
// A port is allowed but checked against the scheme default when present.

use log::warn;
use std::net::IpAddr;
use url::{Host, Url};

use crate::atoms::error::{GatewayError, GatewayResult};

/// Validate a client-supplied base URL. Errors are `invalid_argument`.
pub async fn check_base_url(raw: &str) -> GatewayResult<()> {
    let url = Url::parse(raw)
        .map_err(|e| GatewayError::invalid(format!("base_url is not an absolute URL: {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(GatewayError::invalid(format!(
                "base_url scheme {other:?} is not allowed"
            )))
        }
    }

    if let Some(port) = url.port() {
        // Explicit scheme-default ports are fine; anything below 1024 that
        // is not the scheme default is suspicious enough to refuse.
        let default = if url.scheme() == "https" { 443 } else { 80 };
        if port != default && port < 1024 {
            return Err(GatewayError::invalid(format!(
                "base_url port {port} is not allowed for scheme {}",
                url.scheme()
            )));
        }
    }

    let host = url
        .host()
        .ok_or_else(|| GatewayError::invalid("base_url has no host".to_string()))?;

    match host {
        Host::Ipv4(ip) => reject_ip(IpAddr::V4(ip), raw)?,
        Host::Ipv6(ip) => reject_ip(IpAddr::V6(ip), raw)?,
        Host::Domain(domain) => {
            // DNS-rebinding guard: every address the name resolves to must
            // be public.
            let lookup = format!("{domain}:{}", url.port_or_known_default().unwrap_or(443));
            let addrs = tokio::net::lookup_host(lookup).await.map_err(|e| {
                GatewayError::invalid(format!("base_url host {domain:?} did not resolve: {e}"))
            })?;
            let mut any = false;
            for addr in addrs {
                any = true;
                reject_ip(addr.ip(), raw)?;
            }
            if !any {
                return Err(GatewayError::invalid(format!(
                    "base_url host {domain:?} resolved to no addresses"
                )));
            }
        }
    }
    Ok(())
}

fn reject_ip(ip: IpAddr, raw: &str) -> GatewayResult<()> {
    if !is_public(ip) {
        warn!("[tenant] Rejected base_url {raw:?}: address {ip} is not public");
        return Err(GatewayError::invalid(
            "base_url host resolves to a non-public address".to_string(),
        ));
    }
    Ok(())
}

/// True when the address is routable on the public internet.
fn is_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                // Carrier-grade NAT, 100.64.0.0/10.
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0b1100_0000) == 64))
        }
        IpAddr::V6(v6) => {
            // Mapped IPv4 inherits the IPv4 verdict.
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_public(IpAddr::V4(v4));
            }
            !(v6.is_loopback()
                || v6.is_unspecified()
                // Unique-local fc00::/7.
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // Link-local fe80::/10.
                || (v6.segments()[0] & 0xffc0) == 0xfe80)
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
