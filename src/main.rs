fn main() {
    #[cfg(feature = "cli")]
    treedelta::cli::run();

    #[cfg(not(feature = "cli"))]
    {
        eprintln!("treedelta: CLI not enabled. Rebuild with `--features cli`.");
        std::process::exit(1);
    }
}
