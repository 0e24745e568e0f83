fn main() {
    if let Err(error) = readium_thumbs::run(std::env::args_os()) {
        eprintln!("{error:#}");
        std::process::exit(1);
    }
}
