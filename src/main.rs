use tiflow::core::terminal;

#[tokio::main]
async fn main() {
    match tiflow::cli::run_main().await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            terminal::print_error(&format!("{:#}", e));
            std::process::exit(1);
        }
    }
}
