// Summary outputs: the JSON summary consumed by visualizers and the unit
// tests, a CSV summary table, and the comparison against a reference
// summary.

use std::collections::BTreeMap;
use std::fs;

use log::{info, warn};
use rust_decimal::Decimal;
use serde_json::json;
use serde_json::Map as JSMap;
use serde_json::Value as JSValue;
use snafu::ResultExt;
use text_diff::print_diff;

use ranked_tabulation::{BallotStatus, ContestConfig, ContestResult, RoundTally, TallyTransfers};

use crate::rcv::*;

const VERSION: Option<&str> = option_env!("CARGO_PKG_VERSION");

fn decimal_js(value: Decimal) -> JSValue {
    json!(value.normalize().to_string())
}

fn inactive_json_map(round_tally: &RoundTally) -> JSValue {
    let statuses = [
        ("overvotes", BallotStatus::InactiveByOvervote),
        ("skippedRankings", BallotStatus::InactiveBySkippedRanking),
        ("exhaustedChoices", BallotStatus::InactiveByExhaustedChoices),
        ("repeatedRankings", BallotStatus::InactiveByRepeatedRanking),
    ];
    let mut inactive: JSMap<String, JSValue> = JSMap::new();
    for (key, status) in statuses {
        inactive.insert(key.to_string(), decimal_js(round_tally.inactive_tally(status)));
    }
    JSValue::Object(inactive)
}

// One action object per candidate elected or eliminated this round, with
// the transfers the action triggered. Transfers are stored under the round
// after the tallies which triggered them.
fn action_objects(
    action_type: &str,
    candidates: &[&String],
    round: u32,
    transfers: &TallyTransfers,
) -> Vec<JSValue> {
    let mut actions: Vec<JSValue> = Vec::new();
    for candidate in candidates {
        let mut transfer_map: JSMap<String, JSValue> = JSMap::new();
        if let Some(from_candidate) = transfers.transfers_from(round + 1, candidate) {
            for (target, value) in from_candidate {
                transfer_map.insert(target.clone(), decimal_js(*value));
            }
        }
        actions.push(json!({
            action_type: candidate,
            "transfers": transfer_map,
        }));
    }
    actions
}

/// Assembles the summary for the whole contest, or for one precinct when
/// `precinct` is given.
pub fn build_summary_json(
    config: &RcvConfig,
    contest: &ContestConfig,
    result: &ContestResult,
    precinct: Option<&str>,
) -> JSValue {
    let empty_tallies = BTreeMap::new();
    let empty_transfers = TallyTransfers::new();
    let (round_tallies, transfers) = match precinct {
        Some(p) => (
            result.precinct_round_tallies.get(p).unwrap_or(&empty_tallies),
            result.precinct_tally_transfers.get(p).unwrap_or(&empty_transfers),
        ),
        None => (&result.round_tallies, &result.tally_transfers),
    };

    let mut config_data: JSMap<String, JSValue> = JSMap::new();
    config_data.insert(
        "generatedBy".to_string(),
        json!(format!("rcvcount {}", VERSION.unwrap_or("unknown"))),
    );
    config_data.insert(
        "contest".to_string(),
        json!(config.output_settings.contest_name),
    );
    config_data.insert("date".to_string(), json!(config.output_settings.contest_date));
    config_data.insert(
        "jurisdiction".to_string(),
        json!(config.output_settings.contest_jurisdiction),
    );
    config_data.insert(
        "office".to_string(),
        json!(config.output_settings.contest_office),
    );
    if let Some(p) = precinct {
        config_data.insert("precinct".to_string(), json!(p));
    }

    // invert the per-candidate ledgers into per-round action lists
    let mut round_to_winners: BTreeMap<u32, Vec<&String>> = BTreeMap::new();
    for (winner, round) in &result.winner_to_round {
        round_to_winners.entry(*round).or_default().push(winner);
    }
    let mut round_to_eliminated: BTreeMap<u32, Vec<&String>> = BTreeMap::new();
    for (candidate, round) in &result.candidate_to_round_eliminated {
        round_to_eliminated.entry(*round).or_default().push(candidate);
    }

    let mut results: Vec<JSValue> = Vec::new();
    for (round, round_tally) in round_tallies {
        let mut tally: JSMap<String, JSValue> = JSMap::new();
        for (candidate, votes) in round_tally.tallies() {
            tally.insert(candidate.clone(), decimal_js(*votes));
        }
        let mut actions: Vec<JSValue> = Vec::new();
        if let Some(winners) = round_to_winners.get(round) {
            actions.extend(action_objects("elected", winners, *round, transfers));
        }
        if let Some(eliminated) = round_to_eliminated.get(round) {
            actions.extend(action_objects("eliminated", eliminated, *round, transfers));
        }
        results.push(json!({
            "round": round,
            "tally": tally,
            "threshold": decimal_js(round_tally.winning_threshold()),
            "inactiveBallots": inactive_json_map(round_tally),
            "tallyResults": actions,
        }));
    }

    let first_round = round_tallies.get(&1);
    let undervotes = first_round
        .map(|t| t.inactive_tally(BallotStatus::InactiveByUndervote))
        .unwrap_or(Decimal::ZERO);
    let total_ballots = first_round
        .map(|t| t.num_active_ballots() + t.num_inactive_ballots())
        .unwrap_or(Decimal::ZERO);
    let final_threshold = round_tallies
        .get(&result.num_rounds)
        .map(|t| t.winning_threshold())
        .unwrap_or(Decimal::ZERO);
    let summary_data = json!({
        "finalThreshold": decimal_js(final_threshold),
        "numWinners": contest.num_winners,
        "numCandidates": contest.num_candidates(),
        "totalNumBallots": decimal_js(total_ballots),
        "undervotes": decimal_js(undervotes),
    });

    json!({
        "jsonFormatVersion": "1",
        "summary": summary_data,
        "config": JSValue::Object(config_data),
        "results": results,
    })
}

fn csv_cell(value: Option<Decimal>) -> String {
    value.map(|v| v.normalize().to_string()).unwrap_or_default()
}

fn write_csv_summary(
    path: &str,
    config: &RcvConfig,
    result: &ContestResult,
    round_tallies: &BTreeMap<u32, RoundTally>,
) -> RcvResult<()> {
    info!("Generating summary CSV file: {}...", path);
    let mut writer = csv::Writer::from_path(path).context(CsvOpenSnafu {})?;

    let rounds: Vec<u32> = round_tallies.keys().copied().collect();
    writer
        .write_record(["Contest", config.output_settings.contest_name.as_str()])
        .context(WritingCsvSummarySnafu {})?;
    if let Some(jurisdiction) = &config.output_settings.contest_jurisdiction {
        writer
            .write_record(["Jurisdiction", jurisdiction.as_str()])
            .context(WritingCsvSummarySnafu {})?;
    }

    let mut header: Vec<String> = vec!["Rounds".to_string()];
    header.extend(rounds.iter().map(|r| format!("Round {}", r)));
    writer
        .write_record(&header)
        .context(WritingCsvSummarySnafu {})?;

    // every candidate that ever appears in a round tally
    let mut candidates: Vec<String> = Vec::new();
    for tally in round_tallies.values() {
        for candidate in tally.candidates() {
            if !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
        }
    }
    candidates.sort();
    for candidate in &candidates {
        let mut row: Vec<String> = vec![candidate.clone()];
        for round in &rounds {
            row.push(csv_cell(round_tallies[round].candidate_tally(candidate)));
        }
        writer.write_record(&row).context(WritingCsvSummarySnafu {})?;
    }

    let mut threshold_row: Vec<String> = vec!["Winning Threshold".to_string()];
    for round in &rounds {
        threshold_row.push(csv_cell(Some(round_tallies[round].winning_threshold())));
    }
    writer
        .write_record(&threshold_row)
        .context(WritingCsvSummarySnafu {})?;

    let labels = [
        ("Inactive Ballots by Overvotes", BallotStatus::InactiveByOvervote),
        ("Inactive Ballots by Skipped Rankings", BallotStatus::InactiveBySkippedRanking),
        ("Inactive Ballots by Exhausted Choices", BallotStatus::InactiveByExhaustedChoices),
        ("Inactive Ballots by Repeated Rankings", BallotStatus::InactiveByRepeatedRanking),
        ("Inactive Ballots by Undervotes", BallotStatus::InactiveByUndervote),
    ];
    for (label, status) in labels {
        let mut row: Vec<String> = vec![label.to_string()];
        for round in &rounds {
            row.push(csv_cell(Some(round_tallies[round].inactive_tally(status))));
        }
        writer.write_record(&row).context(WritingCsvSummarySnafu {})?;
    }

    // Undervotes are static through the contest and are not part of the
    // reported inactive total.
    let mut total_row: Vec<String> = vec!["Inactive Ballots Total".to_string()];
    for round in &rounds {
        let tally = &round_tallies[round];
        let total = tally.num_inactive_ballots()
            - tally.inactive_tally(BallotStatus::InactiveByUndervote);
        total_row.push(csv_cell(Some(total)));
    }
    writer
        .write_record(&total_row)
        .context(WritingCsvSummarySnafu {})?;

    let has_residual = result
        .round_to_residual_surplus
        .values()
        .any(|v| *v > Decimal::ZERO);
    if has_residual {
        let mut residual_row: Vec<String> = vec!["Residual Surplus".to_string()];
        for round in &rounds {
            residual_row.push(csv_cell(result.round_to_residual_surplus.get(round).copied()));
        }
        writer
            .write_record(&residual_row)
            .context(WritingCsvSummarySnafu {})?;
    }

    writer.flush().context(WritingOutputSnafu { path })?;
    Ok(())
}

fn write_json_file(path: &str, value: &JSValue) -> RcvResult<()> {
    info!("Generating summary JSON file: {}...", path);
    let pretty = serde_json::to_string_pretty(value).context(ParsingJsonSnafu {})?;
    fs::write(path, pretty).context(WritingOutputSnafu { path })?;
    Ok(())
}

/// Writes the JSON and CSV summaries (and their per-precinct variants when
/// precinct tabulation is enabled) under the given base path.
pub fn write_summary_files(
    out_path: &str,
    pass_suffix: Option<u32>,
    config: &RcvConfig,
    contest: &ContestConfig,
    result: &ContestResult,
) -> BRcvResult<()> {
    let base = out_path.trim_end_matches(".json");
    let base = match pass_suffix {
        Some(pass) => format!("{}_pass_{}", base, pass),
        None => base.to_string(),
    };

    let summary = build_summary_json(config, contest, result, None);
    write_json_file(&format!("{}.json", base), &summary)?;
    write_csv_summary(&format!("{}.csv", base), config, result, &result.round_tallies)?;

    if contest.tabulate_by_precinct {
        for precinct in &result.precinct_ids {
            let precinct_summary = build_summary_json(config, contest, result, Some(precinct));
            let precinct_base =
                format!("{}_precinct_{}", base, io_common::sanitize_id(precinct));
            write_json_file(&format!("{}.json", precinct_base), &precinct_summary)?;
            if let Some(tallies) = result.precinct_round_tallies.get(precinct) {
                write_csv_summary(&format!("{}.csv", precinct_base), config, result, tallies)?;
            }
        }
    }
    Ok(())
}

fn read_summary(path: String) -> BRcvResult<JSValue> {
    let contents = fs::read_to_string(path.clone()).context(OpeningJsonSnafu { path })?;
    let js: JSValue = serde_json::from_str(contents.as_str()).context(ParsingJsonSnafu {})?;
    Ok(js)
}

/// Compares the produced summary against a reference file, printing a diff
/// on mismatch.
pub fn check_reference(reference_path: String, produced: &JSValue) -> BRcvResult<()> {
    let reference = read_summary(reference_path)?;
    let pretty_reference =
        serde_json::to_string_pretty(&reference).context(ParsingJsonSnafu {})?;
    let pretty_produced = serde_json::to_string_pretty(produced).context(ParsingJsonSnafu {})?;
    if pretty_reference != pretty_produced {
        warn!("Found differences with the reference summary");
        print_diff(pretty_reference.as_str(), pretty_produced.as_str(), "\n");
        return Err(Box::new(RcvError::ReferenceMismatch {}));
    }
    info!("The tabulated summary matches the reference summary.");
    Ok(())
}
