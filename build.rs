fn main() {
    // ── macOS: embed Info.plist so CoreBluetooth grants Bluetooth access ──────
    //
    // CBCentralManager stays "unauthorised" and never scans unless the running
    // binary carries an Info.plist with NSBluetoothAlwaysUsageDescription.
    // A CLI tool has no bundle, so the plist goes into the __TEXT,__info_plist
    // section of the Mach-O via the linker's `-sectcreate` flag.
    //
    // `CARGO_CFG_TARGET_OS` is the *target* OS, so cross builds work too.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("macos") {
        let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") else {
            return;
        };
        let plist = format!("{dir}/Info.plist");

        // ld … -sectcreate __TEXT __info_plist /path/to/Info.plist …
        println!("cargo:rustc-link-arg-bins=-sectcreate");
        println!("cargo:rustc-link-arg-bins=__TEXT");
        println!("cargo:rustc-link-arg-bins=__info_plist");
        println!("cargo:rustc-link-arg-bins={plist}");
        println!("cargo:rerun-if-changed=Info.plist");
    }
}
