fn main() -> anyhow::Result<()> {
    pbix_cli::cli::run()
}
