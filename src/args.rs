use clap::Parser;

/// This is a ranked voting tabulation program.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// (file path) The contest description in JSON format, following the
    /// RCTab configuration layout: output settings, cvr file sources,
    /// candidates and rules.
    #[clap(short, long, value_parser)]
    pub config: String,

    /// (file path) A reference file containing the outcome of an election in
    /// JSON format. If provided, rcvcount will check that the tabulated
    /// output matches the reference.
    #[clap(short, long, value_parser)]
    pub reference: Option<String>,

    /// (file path) If specified, the summary of the election will be written
    /// in JSON format to the given location, with a CSV summary next to it.
    /// Otherwise the JSON summary is printed to the standard output.
    #[clap(short, long, value_parser)]
    pub out: Option<String>,

    /// If passed as an argument, will turn on verbose logging to the
    /// standard output.
    #[clap(long, takes_value = false)]
    pub verbose: bool,
}
