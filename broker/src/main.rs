use broker::cli::Args;

pub fn main() -> anyhow::Result<()> {
    // Tolerate a missing .env; production sets real env vars.
    let _ = dotenvy::dotenv();
    logger::init();

    let args = argh::from_env::<Args>();
    args.run()
}
