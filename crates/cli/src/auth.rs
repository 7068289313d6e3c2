//! Token resolution through the `sprite` CLI.
//!
//! When neither `--token` nor `SPRITE_TOKEN` is given, find which org
//! the sprite lives in and scrape the bearer token the sprite CLI uses
//! for that org. Reading the token out of `sprite api -v` stderr is
//! ugly but avoids depending on the CLI's credential storage format.

use std::process::Command;

use color_eyre::eyre::{eyre, Result, WrapErr};
use regex::Regex;
use serde::Deserialize;

/// Resolve a bearer token for `sprite` via the installed sprite CLI.
///
/// # Errors
/// Returns an error if the CLI is missing, the sprite is in no visible
/// org, or no token can be scraped.
pub fn resolve_token(sprite: &str) -> Result<String> {
    let orgs = list_orgs().wrap_err("list orgs")?;
    let org = find_org_for_sprite(&orgs, sprite)?;
    tracing::debug!("resolved sprite org: sprite={sprite} org={org}");
    get_org_token(&org).wrap_err_with(|| format!("get token for org {org}"))
}

fn list_orgs() -> Result<Vec<String>> {
    let out = Command::new("sprite")
        .args(["org", "list"])
        .output()
        .wrap_err("sprite CLI not found")?;
    if !out.status.success() {
        return Err(eyre!(
            "sprite org list: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        ));
    }

    // Org listings look like "  1. my-org (personal)".
    let line_re = Regex::new(r"^\s*\d+\.\s+(\S+)").expect("static regex");
    let orgs: Vec<String> = String::from_utf8_lossy(&out.stdout)
        .lines()
        .filter_map(|line| line_re.captures(line))
        .map(|c| c[1].to_string())
        .collect();

    if orgs.is_empty() {
        return Err(eyre!("no orgs found; run 'sprite login' first"));
    }
    Ok(orgs)
}

#[derive(Deserialize)]
struct SpritesResponse {
    #[serde(default)]
    sprites: Vec<SpriteName>,
}

#[derive(Deserialize)]
struct SpriteName {
    name: String,
}

fn find_org_for_sprite(orgs: &[String], sprite: &str) -> Result<String> {
    for org in orgs {
        let out = match Command::new("sprite")
            .args(["api", "-o", org, "/sprites"])
            .output()
        {
            Ok(out) if out.status.success() => out,
            _ => {
                tracing::debug!("failed to list sprites for org {org}");
                continue;
            }
        };

        let Ok(resp) = serde_json::from_slice::<SpritesResponse>(&out.stdout) else {
            tracing::debug!("failed to parse sprites JSON for org {org}");
            continue;
        };
        if resp.sprites.iter().any(|s| s.name == sprite) {
            return Ok(org.clone());
        }
    }
    Err(eyre!("sprite {sprite:?} not found in any org"))
}

fn get_org_token(org: &str) -> Result<String> {
    // The verbose flag makes the CLI print its request headers to
    // stderr; the exit status does not matter here.
    let out = Command::new("sprite")
        .args(["api", "-o", org, "/", "-v"])
        .output()
        .wrap_err("sprite api")?;

    let stderr = String::from_utf8_lossy(&out.stderr);
    for line in stderr.lines() {
        if let Some((_, after)) = line.split_once("authorization: Bearer ") {
            let token = after.trim_end_matches('\r');
            if !token.is_empty() {
                return Ok(token.to_string());
            }
        }
    }
    Err(eyre!("no Bearer token in sprite api output"))
}
