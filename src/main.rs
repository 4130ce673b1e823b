use anyhow::Result;

fn main() -> Result<()> {
    varconvert::cli::run()
}
