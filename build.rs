fn main() {
    // Compile-time libraries are dlopen'd into the running process and call
    // back into the cinder_* bridge symbols, which must therefore appear in
    // the dynamic symbol table of the executable.
    #[cfg(all(unix, not(target_os = "macos")))]
    println!("cargo:rustc-link-arg=-rdynamic");
}
