use clap::Parser;

fn main() -> anyhow::Result<()> {
    let opts = bidsglm::Opts::parse();
    bidsglm::init_logging();
    bidsglm::run(&opts)?;
    Ok(())
}
