fn main() {
    println!("cargo:rerun-if-env-changed=LIBTORCH");

    // tch finds libtorch itself; an explicit LIBTORCH only adds its lib dir
    // to the search path so the TorchScript detector links on custom installs.
    if let Ok(libtorch_path) = std::env::var("LIBTORCH") {
        println!("cargo:rustc-link-search=native={}/lib", libtorch_path);
        println!("cargo:rustc-link-lib=dylib=torch");
        println!("cargo:rustc-link-lib=dylib=c10");
    }
}
