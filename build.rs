// build.rs

// `PGCLUSTER_VERSION` overrides the version the binary reports, for packaged builds.
fn main() {
    println!("cargo:rerun-if-env-changed=PGCLUSTER_VERSION");
    if let Ok(version) = std::env::var("PGCLUSTER_VERSION") {
        println!("cargo:rustc-env=PGCLUSTER_BUILD_VERSION={version}");
    }
}
