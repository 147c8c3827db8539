use crossvault::{cli, CrossvaultError};

#[tokio::main]
async fn main() {
    // Load .env file if it exists (optional - won't fail if missing)
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: Error loading .env file: {}", e);
        }
    }

    let code = match cli::run_cli().await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("Error: {:#}", error);
            error.downcast_ref::<CrossvaultError>().map(CrossvaultError::exit_code).unwrap_or(1)
        }
    };

    std::process::exit(code);
}
