use std::process::ExitCode;

fn main() -> anyhow::Result<ExitCode> {
    pipelinebench::cli::execute()
}
