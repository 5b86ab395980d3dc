//! Build script for torgw
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! for `torgw version`.

fn main() {
    // Re-run build if the packager overrides the default torrc location
    println!("cargo:rerun-if-env-changed=TORGW_SYSTEM_TORRC_PATH");

    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
