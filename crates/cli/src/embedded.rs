//! Embedded agent binary
//!
//! When `SPRYNC_AGENT_BIN` points at a built spryncd at compile time,
//! the binary is embedded and uploaded into sprites on session open.

use color_eyre::eyre::Result;

#[cfg(sprync_embed_agent)]
pub fn agent_binary() -> Result<&'static [u8]> {
    Ok(include_bytes!(env!("SPRYNC_AGENT_BIN")))
}

#[cfg(not(sprync_embed_agent))]
pub fn agent_binary() -> Result<&'static [u8]> {
    color_eyre::eyre::bail!(
        "no agent binary embedded in this build; \
         rebuild with SPRYNC_AGENT_BIN=/path/to/spryncd"
    )
}
