use anyhow::Context;
use clap::Parser;
use kube::CustomResourceExt;
use operator::crd::Search;

#[derive(Parser, Debug)]
#[command(version, about = "Print or write the Search CRD", long_about = None)]
struct Args {
    /// Output directory; the CRD is printed to stdout when omitted
    #[arg(short, long)]
    output: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let yaml = serde_yaml::to_string(&Search::crd())?;
    match args.output {
        Some(dir) => {
            // Create directory if it does not exist
            std::fs::create_dir_all(&dir).with_context(|| format!("creating {dir}"))?;
            std::fs::write(format!("{dir}/search.yaml"), yaml)
                .with_context(|| format!("writing {dir}/search.yaml"))?;
        }
        None => print!("{yaml}"),
    }
    Ok(())
}
