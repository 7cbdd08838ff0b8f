//! Build script for hostfw
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! shown by `hostfw status`.

fn main() {
    // Re-run when tests or packagers override tool paths at build time
    println!("cargo:rerun-if-env-changed=HOSTFW_NFT_COMMAND");
    println!("cargo:rerun-if-env-changed=HOSTFW_IPTABLES_COMMAND");

    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
