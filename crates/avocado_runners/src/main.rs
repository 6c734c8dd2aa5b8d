fn main() -> std::process::ExitCode {
    avocado_runners::app::main_with_args(std::env::args_os())
}
