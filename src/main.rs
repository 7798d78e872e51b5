use std::env;
use std::process::ExitCode;
use tpm_disk::cli::Cli;
use tpm_disk::disk::DiskError;

fn main() -> ExitCode {
    let cli = Cli::new();
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    env::set_var("TSS2_LOG", "all+NONE");

    match cli.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            eprintln!("Error: {:?}", report);
            let code = report
                .downcast_ref::<DiskError>()
                .map(|err| err.category().exit_code())
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}
