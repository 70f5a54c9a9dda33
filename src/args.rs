use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Tracking configuration file (created with defaults if missing)
    #[arg(long, default_value = "tracking.json")]
    pub config: String,

    /// How long to run the demo pipeline, seconds
    #[arg(long, default_value_t = 4.0)]
    pub duration: f64,

    /// Override the synthetic camera frame rate
    #[arg(long)]
    pub fps: Option<f64>,

    /// Print the column schema and exit
    #[arg(long)]
    pub columns: bool,

    /// Print the last accumulated rows on exit
    #[arg(long, default_value_t = 5)]
    pub tail_rows: usize,
}
