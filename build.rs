//! Build script for nftsync
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! shown by `nftsync --verbose`.

fn main() {
    println!("cargo:rerun-if-env-changed=NFTSYNC_NFT_COMMAND");

    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
