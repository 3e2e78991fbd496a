use clap::Parser;
use runtimed::Args;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	let args = Args::parse();
	runtimed::main(args).await
}
