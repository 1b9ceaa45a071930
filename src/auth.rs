//! NIP-42 authentication event validation.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Result};
use url::Url;

use crate::event::{Event, KIND_CLIENT_AUTHENTICATION};

/// Tolerated skew between the auth event timestamp and the relay clock.
const MAX_SKEW: u64 = 10 * 60;

/// Validate a client authentication event against the connection challenge
/// and the relay's service URL, returning the authenticated pubkey.
pub(crate) fn validate_auth_event(
    event: &Event,
    challenge: &str,
    service_url: &str,
) -> Result<String> {
    event.verify().map_err(anyhow::Error::new)?;
    if event.kind != KIND_CLIENT_AUTHENTICATION {
        bail!("wrong event kind");
    }
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    if event.created_at + MAX_SKEW < now || event.created_at > now + MAX_SKEW {
        bail!("timestamp out of tolerance");
    }
    if event.tag_value("challenge") != Some(challenge) {
        bail!("challenge mismatch");
    }
    let relay_tag = event
        .tag_value("relay")
        .ok_or_else(|| anyhow!("missing relay tag"))?;
    if !same_host(relay_tag, service_url)? {
        bail!("relay url mismatch");
    }
    Ok(event.pubkey.clone())
}

/// Compare two URLs by host and port, ignoring scheme and path.
fn same_host(a: &str, b: &str) -> Result<bool> {
    let a = Url::parse(a)?;
    let b = Url::parse(b)?;
    Ok(a.host_str() == b.host_str() && a.port_or_known_default() == b.port_or_known_default())
}
