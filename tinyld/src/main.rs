fn main() {
    if let Err(error) = run() {
        libtinyld::error::report_error_and_exit(&error)
    }
}

fn run() -> libtinyld::error::Result {
    let linker = libtinyld::Linker::from_args(std::env::args().skip(1))?;
    linker.run()
}
