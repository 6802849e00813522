fn main() {
    if let Err(e) = phonesim_lib::run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
