fn main() {
    // Register the expected cfg flag for check-cfg
    println!("cargo::rustc-check-cfg=cfg(sprync_embed_agent)");

    // The agent binary path is injected by the release build; without
    // it the CLI still builds but cannot open sessions.
    println!("cargo:rerun-if-env-changed=SPRYNC_AGENT_BIN");
    if std::env::var("SPRYNC_AGENT_BIN").is_ok() {
        println!("cargo:rustc-cfg=sprync_embed_agent");
    }
}
