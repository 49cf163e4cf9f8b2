fn main() {
    let exit_code = match joist::run::run() {
        Ok(code) => code,
        Err(err) => {
            println!("joist: error: {}", err);
            1
        }
    };
    std::process::exit(exit_code);
}
