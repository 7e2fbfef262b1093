use clap::Parser;
use mpegts_streamer::streamer::{Options, run};

#[derive(Parser)]
#[command(about = "Demultiplex an MPEG-TS feed into elementary-stream packets over TCP")]
struct Opt {
    /// UDP socket to bind for the incoming transport stream (IPv4)
    #[clap(long, default_value = "239.1.1.2:1234")]
    input: String,

    /// TCP address subscribers connect to
    #[clap(long, default_value = "0.0.0.0:34890")]
    listen: String,

    /// Disable RDS side-stream extraction from MPEG audio
    #[clap(long, default_value_t = false)]
    no_rds: bool,

    /// Seconds between JSON status snapshots
    #[clap(long, default_value_t = 10)]
    status_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opt = Opt::parse();

    run(Options {
        input: opt.input.parse()?,
        listen: opt.listen.parse()?,
        enable_rds: !opt.no_rds,
        status_secs: opt.status_secs,
    })
    .await
}
