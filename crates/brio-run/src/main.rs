use clap::Parser;

fn main() -> miette::Result<()> {
    brio_run::Cli::parse().run()
}
