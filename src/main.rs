fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{}", first_run_installer::USAGE);
        return;
    }

    std::process::exit(first_run_installer::run_cli(args));
}
