fn main() {
    if let Err(err) = rsvrun::cli::run() {
        rsvrun::ui::eprintln_error(&err);
        std::process::exit(rsvrun::exit::exit_code(&err));
    }
}
