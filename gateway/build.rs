fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    // Host builds have no IDF toolchain to export.
    if std::env::var_os("CARGO_FEATURE_ESP32").is_some() {
        embuild::espidf::sysenv::output();
    }
}
