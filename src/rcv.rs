use std::fs;
use std::path::{Path, PathBuf};

use log::info;

use snafu::{ResultExt, Snafu};

use ranked_tabulation::{
    tabulate_sequential, CandidateRankings, CandidatesAtRanking, CastVoteRecord, ContestConfig,
    ContestResult, TabulationError, Tabulator, EXPLICIT_OVERVOTE_LABEL, UNDECLARED_WRITE_IN_LABEL,
};

pub mod config_reader;
pub mod io_common;
pub mod io_csv;
pub mod io_ess;
pub mod summary;

pub use crate::rcv::config_reader::{FileSource, RcvConfig};

use crate::rcv::io_common::sanitize_id;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RcvError {
    #[snafu(display("could not open JSON file {}: {}", path, source))]
    OpeningJson {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("could not parse JSON content: {}", source))]
    ParsingJson { source: serde_json::Error },
    #[snafu(display("could not interpret a number in the configuration"))]
    ParsingJsonNumber {},
    #[snafu(display("could not open CSV file: {}", source))]
    CsvOpen { source: csv::Error },
    #[snafu(display("could not parse a CSV line: {}", source))]
    CsvLineParse { source: csv::Error },
    #[snafu(display("CSV line {} is too short", lineno))]
    CsvLineTooShort { lineno: usize },
    #[snafu(display("could not open Excel file {}: {}", path, source))]
    OpeningExcel {
        path: String,
        source: calamine::XlsxError,
    },
    #[snafu(display("the Excel workbook has no readable worksheet"))]
    EmptyExcel {},
    #[snafu(display("unexpected cell content at line {}: {}", lineno, content))]
    ExcelWrongCellType { lineno: u64, content: String },
    #[snafu(display("could not write output file {}: {}", path, source))]
    WritingOutput {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("could not write CSV summary: {}", source))]
    WritingCsvSummary { source: csv::Error },
    #[snafu(display("tabulation failed: {}", source))]
    Tabulation { source: TabulationError },
    #[snafu(display("the tabulated summary differs from the reference summary"))]
    ReferenceMismatch {},
    #[snafu(whatever, display("{}", message))]
    Whatever { message: String },
}

pub type RcvResult<T> = Result<T, RcvError>;
pub type BRcvResult<T> = Result<T, Box<RcvError>>;

/// One ballot as it comes out of a reader, before normalization: a list of
/// raw marks per rank (empty list = blank rank).
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ParsedBallot {
    pub id: Option<String>,
    pub count: Option<u64>,
    pub precinct: Option<String>,
    pub choices: Vec<Vec<String>>,
}

fn read_ranking_data(root_path: &str, cfs: &FileSource) -> BRcvResult<Vec<ParsedBallot>> {
    let p: PathBuf = [root_path, cfs.file_path.as_str()].iter().collect();
    let p2 = p.as_path().display().to_string();
    info!("Attempting to read rank file {:?}", p2);
    match cfs.provider.as_str() {
        "csv" => io_csv::read_csv_ranking(p2, cfs),
        "ess" => io_ess::read_excel_file(p2, cfs),
        x => Err(Box::new(RcvError::Whatever {
            message: format!("provider not implemented: {:?}", x),
        })),
    }
}

// Turns raw marks into the engine's ranking structure: labels are mapped to
// the overvote / write-in sentinels, unknown names become undeclared
// write-ins, blanks stay blank, and ranks past the contest limit are
// dropped. Weighted ballots are expanded into unit ballots.
fn build_cast_vote_records(
    parsed: &[ParsedBallot],
    cfs: &FileSource,
    contest: &ContestConfig,
) -> Vec<CastVoteRecord> {
    let mut result = Vec::new();
    for ballot in parsed {
        let mut pairs: Vec<(u32, CandidatesAtRanking)> = Vec::new();
        for (rank0, raw_marks) in ballot.choices.iter().enumerate() {
            let rank = rank0 as u32 + 1;
            if rank > contest.max_rankings_allowed {
                break;
            }
            let mut marks: Vec<String> = Vec::new();
            for raw in raw_marks {
                let raw = raw.trim();
                if raw.is_empty() {
                    if cfs.treat_blank_as_undeclared_write_in.unwrap_or(false) {
                        push_unique(&mut marks, UNDECLARED_WRITE_IN_LABEL);
                    }
                    continue;
                }
                if Some(raw) == cfs.undervote_label.as_deref() {
                    continue;
                }
                if Some(raw) == cfs.overvote_label.as_deref() {
                    push_unique(&mut marks, EXPLICIT_OVERVOTE_LABEL);
                    continue;
                }
                match contest.name_for_candidate(raw) {
                    Some(name) => {
                        let name = name.to_string();
                        push_unique(&mut marks, &name);
                    }
                    None => push_unique(&mut marks, UNDECLARED_WRITE_IN_LABEL),
                }
            }
            if !marks.is_empty() {
                pairs.push((rank, CandidatesAtRanking::new(marks)));
            }
        }

        let base_id = sanitize_id(ballot.id.as_deref().unwrap_or("ballot"));
        let count = ballot.count.unwrap_or(1);
        for copy in 0..count {
            let id = if count > 1 {
                format!("{}-{}", base_id, copy + 1)
            } else {
                base_id.clone()
            };
            let mut cvr =
                CastVoteRecord::new(&id, CandidateRankings::new(pairs.clone()));
            cvr.precinct = ballot.precinct.clone();
            result.push(cvr);
        }
    }
    result
}

fn push_unique(marks: &mut Vec<String>, mark: &str) {
    if !marks.iter().any(|m| m == mark) {
        marks.push(mark.to_string());
    }
}

fn run_single_contest(
    cast_vote_records: Vec<CastVoteRecord>,
    contest: &ContestConfig,
) -> RcvResult<Vec<ContestResult>> {
    if contest.is_multi_seat_sequential_winner_takes_all() {
        return tabulate_sequential(&cast_vote_records, contest).context(TabulationSnafu {});
    }
    let mut tabulator =
        Tabulator::new(cast_vote_records, contest.clone()).context(TabulationSnafu {})?;
    let winners = tabulator.tabulate().context(TabulationSnafu {})?;
    info!("Contest winner(s): {:?}", winners);
    Ok(vec![tabulator.into_result()])
}

/// Reads the contest configuration and ballots, runs the tabulation, writes
/// the summaries, and (when requested) checks the output against a
/// reference summary.
pub fn run_contest(
    config_path: String,
    check_reference_path: Option<String>,
    out_path: Option<String>,
) -> BRcvResult<()> {
    let config_p = Path::new(config_path.as_str());
    let config_str = fs::read_to_string(config_path.clone()).context(OpeningJsonSnafu {
        path: config_path.clone(),
    })?;
    let config: RcvConfig = serde_json::from_str(&config_str).context(ParsingJsonSnafu {})?;
    info!("config: {:?}", config);

    // Validate the rules before reading any ballot file.
    let contest = config_reader::build_contest_config(&config)?;

    if config.cvr_file_sources.is_empty() {
        return Err(Box::new(RcvError::Whatever {
            message: "no cvr file sources provided in the configuration".to_string(),
        }));
    }

    let root_p = config_p
        .parent()
        .map(|p| p.as_os_str().to_str().unwrap_or_default().to_string())
        .unwrap_or_default();
    let mut cast_vote_records: Vec<CastVoteRecord> = Vec::new();
    for cfs in &config.cvr_file_sources {
        let parsed = read_ranking_data(&root_p, cfs)?;
        let mut file_records = build_cast_vote_records(&parsed, cfs, &contest);
        info!(
            "Read {} cast vote records from {:?}",
            file_records.len(),
            cfs.file_path
        );
        cast_vote_records.append(&mut file_records);
    }

    let results = run_single_contest(cast_vote_records, &contest)?;
    let sequential = results.len() > 1;
    for (idx, result) in results.iter().enumerate() {
        let pass_suffix = if sequential {
            Some((idx + 1) as u32)
        } else {
            None
        };
        let summary_js = summary::build_summary_json(&config, &contest, result, None);

        if let Some(out) = &out_path {
            summary::write_summary_files(out, pass_suffix, &config, &contest, result)?;
        } else {
            let pretty = serde_json::to_string_pretty(&summary_js).context(ParsingJsonSnafu {})?;
            println!("{}", pretty);
        }

        // The reference summary, if provided for comparison (only checked
        // against the final pass of a sequential contest).
        if let Some(reference_path) = &check_reference_path {
            if !sequential || idx + 1 == results.len() {
                summary::check_reference(reference_path.clone(), &summary_js)?;
            }
        }
    }

    Ok(())
}
