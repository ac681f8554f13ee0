fn main() -> anyhow::Result<()> {
    pei::cli::run()
}
