use crate::rcv::*;

use serde::{Deserialize, Serialize};
use serde_json::Value as JSValue;
use snafu::{whatever, OptionExt};

use ranked_tabulation::{
    Candidate, ContestConfig, OvervoteRule, TiebreakMode, WinnerElectionMode,
    UNDECLARED_WRITE_IN_LABEL,
};
use rust_decimal::Decimal;

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    #[serde(rename = "contestName")]
    pub contest_name: String,
    #[serde(rename = "outputDirectory")]
    pub output_directory: Option<String>,
    #[serde(rename = "contestDate")]
    pub contest_date: Option<String>,
    #[serde(rename = "contestJurisdiction")]
    pub contest_jurisdiction: Option<String>,
    #[serde(rename = "contestOffice")]
    pub contest_office: Option<String>,
    #[serde(rename = "tabulateByPrecinct")]
    pub tabulate_by_precinct: Option<bool>,
    #[serde(rename = "generateCdfJson")]
    pub generate_cdf_json: Option<bool>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct FileSource {
    pub provider: String,
    #[serde(rename = "filePath")]
    pub file_path: String,
    #[serde(rename = "contestId")]
    pub contest_id: Option<String>,
    #[serde(rename = "firstVoteColumnIndex")]
    pub first_vote_column_index: Option<JSValue>,
    #[serde(rename = "firstVoteRowIndex")]
    pub first_vote_row_index: Option<JSValue>,
    #[serde(rename = "idColumnIndex")]
    pub id_column_index: Option<JSValue>,
    #[serde(rename = "precinctColumnIndex")]
    pub precinct_column_index: Option<JSValue>,
    #[serde(rename = "countColumnIndex")]
    pub count_column_index: Option<JSValue>,
    #[serde(rename = "overvoteDelimiter")]
    pub overvote_delimiter: Option<String>,
    #[serde(rename = "overvoteLabel")]
    pub overvote_label: Option<String>,
    #[serde(rename = "undervoteLabel")]
    pub undervote_label: Option<String>,
    #[serde(rename = "undeclaredWriteInLabel")]
    pub undeclared_write_in_label: Option<String>,
    #[serde(rename = "treatBlankAsUndeclaredWriteIn")]
    pub treat_blank_as_undeclared_write_in: Option<bool>,
    #[serde(rename = "excelWorksheetName")]
    pub excel_worksheet_name: Option<String>,
}

impl FileSource {
    /// 1-based in the configuration, 0-based for the readers.
    pub fn first_vote_column(&self) -> RcvResult<usize> {
        let x = read_js_int(&self.first_vote_column_index)?;
        Ok(x - 1)
    }

    pub fn first_vote_row(&self) -> RcvResult<usize> {
        let x = read_js_int(&self.first_vote_row_index)?;
        Ok(x - 1)
    }

    pub fn id_column(&self) -> RcvResult<Option<usize>> {
        self.optional_column(&self.id_column_index)
    }

    pub fn precinct_column(&self) -> RcvResult<Option<usize>> {
        self.optional_column(&self.precinct_column_index)
    }

    pub fn count_column(&self) -> RcvResult<Option<usize>> {
        self.optional_column(&self.count_column_index)
    }

    fn optional_column(&self, value: &Option<JSValue>) -> RcvResult<Option<usize>> {
        if value.is_some() {
            read_js_int(value).map(|x| Some(x - 1))
        } else {
            Ok(None)
        }
    }

    /// Declaring a write-in label (or treating blanks as write-ins) brings
    /// the undeclared-write-in bucket into the contest.
    pub fn uses_undeclared_write_ins(&self) -> bool {
        self.undeclared_write_in_label.is_some()
            || self.treat_blank_as_undeclared_write_in.unwrap_or(false)
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct RcvCandidate {
    pub name: String,
    pub code: Option<String>,
    pub excluded: Option<bool>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct RcvRules {
    #[serde(rename = "tiebreakMode")]
    pub tiebreak_mode: String,
    #[serde(rename = "overvoteRule")]
    pub overvote_rule: String,
    #[serde(rename = "winnerElectionMode")]
    pub winner_election_mode: String,
    #[serde(rename = "numberOfWinners")]
    pub number_of_winners: Option<String>,
    #[serde(rename = "randomSeed")]
    pub random_seed: Option<String>,
    #[serde(rename = "maxSkippedRanksAllowed")]
    pub max_skipped_ranks_allowed: String,
    #[serde(rename = "maxRankingsAllowed")]
    pub max_rankings_allowed: String,
    #[serde(rename = "minimumVoteThreshold")]
    pub minimum_vote_threshold: Option<String>,
    #[serde(rename = "decimalPlacesForVoteArithmetic")]
    pub decimal_places_for_vote_arithmetic: Option<String>,
    #[serde(rename = "nonIntegerWinningThreshold")]
    pub non_integer_winning_threshold: Option<bool>,
    #[serde(rename = "hareQuota")]
    pub hare_quota: Option<bool>,
    #[serde(rename = "batchElimination")]
    pub batch_elimination: Option<bool>,
    #[serde(rename = "continueUntilTwoCandidatesRemain")]
    pub continue_until_two_candidates_remain: Option<bool>,
    #[serde(rename = "firstRoundDeterminesThreshold")]
    pub first_round_determines_threshold: Option<bool>,
    #[serde(rename = "exhaustOnDuplicateCandidate")]
    pub exhaust_on_duplicate_candidate: Option<bool>,
    #[serde(rename = "multiSeatBottomsUpPercentageThreshold")]
    pub multi_seat_bottoms_up_percentage_threshold: Option<String>,
    #[serde(rename = "stopTabulationEarlyAfterRound")]
    pub stop_tabulation_early_after_round: Option<String>,
    #[serde(rename = "rulesDescription")]
    pub rules_description: Option<String>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct RcvConfig {
    #[serde(rename = "outputSettings")]
    pub output_settings: OutputSettings,
    #[serde(rename = "cvrFileSources")]
    pub cvr_file_sources: Vec<FileSource>,
    pub candidates: Vec<RcvCandidate>,
    pub rules: RcvRules,
}

/// Validates the textual rules and assembles the engine configuration.
pub fn build_contest_config(config: &RcvConfig) -> RcvResult<ContestConfig> {
    let rules = &config.rules;

    let mut candidates: Vec<Candidate> = config
        .candidates
        .iter()
        .map(|c| Candidate {
            name: c.name.clone(),
            code: match c.code.clone() {
                Some(x) if x.is_empty() => None,
                x => x,
            },
            excluded: c.excluded.unwrap_or(false),
        })
        .collect();
    if config
        .cvr_file_sources
        .iter()
        .any(|cfs| cfs.uses_undeclared_write_ins())
    {
        candidates.push(Candidate::new(UNDECLARED_WRITE_IN_LABEL));
    }

    let mut contest = ContestConfig::new(candidates);

    contest.overvote_rule = match OvervoteRule::from_internal_label(rules.overvote_rule.as_str()) {
        Some(rule) => rule,
        None => whatever!("unknown overvote rule: {}", rules.overvote_rule),
    };
    contest.tiebreak_mode = match TiebreakMode::from_internal_label(rules.tiebreak_mode.as_str()) {
        Some(mode) => mode,
        None => whatever!("unknown tiebreak mode: {}", rules.tiebreak_mode),
    };
    contest.winner_election_mode =
        match WinnerElectionMode::from_internal_label(rules.winner_election_mode.as_str()) {
            Some(mode) => mode,
            None => whatever!("unknown winner election mode: {}", rules.winner_election_mode),
        };

    contest.num_winners = match &rules.number_of_winners {
        None => 1,
        Some(s) => match s.parse::<u32>() {
            Ok(x) => x,
            Err(_) => whatever!("failed to understand numberOfWinners option: {:?}", s),
        },
    };

    contest.max_skipped_ranks_allowed = match rules.max_skipped_ranks_allowed.parse::<u32>() {
        Err(_) if rules.max_skipped_ranks_allowed == "unlimited" => None,
        Ok(x) => Some(x),
        x => whatever!("failed to understand maxSkippedRanksAllowed option: {:?}", x),
    };
    contest.max_rankings_allowed = match rules.max_rankings_allowed.parse::<u32>() {
        Err(_) if rules.max_rankings_allowed == "max" => {
            contest.num_declared_candidates() as u32
        }
        Ok(x) if x > 0 => x,
        x => whatever!("failed to understand maxRankingsAllowed option: {:?}", x),
    };

    contest.minimum_vote_threshold = match &rules.minimum_vote_threshold {
        None => Decimal::ZERO,
        Some(s) => match s.parse::<Decimal>() {
            Ok(x) => x,
            Err(_) => whatever!("failed to understand minimumVoteThreshold option: {:?}", s),
        },
    };
    if let Some(s) = &rules.decimal_places_for_vote_arithmetic {
        contest.decimal_places = match s.parse::<u32>() {
            Ok(x) if x <= 20 => x,
            x => whatever!(
                "failed to understand decimalPlacesForVoteArithmetic option: {:?}",
                x
            ),
        };
    }
    if let Some(s) = &rules.multi_seat_bottoms_up_percentage_threshold {
        // expressed in percent in the configuration, as a fraction in the
        // engine
        contest.multi_seat_bottoms_up_percentage_threshold = match s.parse::<Decimal>() {
            Ok(x) if x > Decimal::ZERO && x <= Decimal::from(100) => Some(x / Decimal::from(100)),
            x => whatever!(
                "failed to understand multiSeatBottomsUpPercentageThreshold option: {:?}",
                x
            ),
        };
    }
    if let Some(s) = &rules.stop_tabulation_early_after_round {
        contest.stop_tabulation_early_after_round = match s.parse::<u32>() {
            Ok(x) if x > 0 => Some(x),
            x => whatever!(
                "failed to understand stopTabulationEarlyAfterRound option: {:?}",
                x
            ),
        };
    }
    contest.random_seed = match &rules.random_seed {
        None => None,
        Some(s) => match s.parse::<u64>() {
            Ok(x) => Some(x),
            Err(_) => whatever!("failed to understand randomSeed option: {:?}", s),
        },
    };

    contest.non_integer_winning_threshold = rules.non_integer_winning_threshold.unwrap_or(false);
    contest.hare_quota = rules.hare_quota.unwrap_or(false);
    contest.batch_elimination = rules.batch_elimination.unwrap_or(false);
    contest.continue_until_two_candidates_remain =
        rules.continue_until_two_candidates_remain.unwrap_or(false);
    contest.first_round_determines_threshold =
        rules.first_round_determines_threshold.unwrap_or(false);
    contest.exhaust_on_duplicate_candidate =
        rules.exhaust_on_duplicate_candidate.unwrap_or(false);
    contest.tabulate_by_precinct = config.output_settings.tabulate_by_precinct.unwrap_or(false);
    contest.generate_cdf_json = config.output_settings.generate_cdf_json.unwrap_or(false);

    if contest.needs_random_seed() && contest.random_seed.is_none() {
        whatever!(
            "tiebreak mode {:?} requires a randomSeed entry",
            rules.tiebreak_mode
        );
    }

    Ok(contest)
}

fn read_js_int(x: &Option<JSValue>) -> RcvResult<usize> {
    match x {
        Some(JSValue::Number(n)) => n
            .as_u64()
            .map(|x| x as usize)
            .context(ParsingJsonNumberSnafu {}),
        // Excel-style column letters
        Some(JSValue::String(s)) if s.chars().all(|c| c.is_alphabetic()) => {
            let mut index: usize = 0;
            for c in s.to_lowercase().chars() {
                index = index * 26 + ((c as usize) - ('a' as usize) + 1);
            }
            Ok(index)
        }
        Some(JSValue::String(s)) => s.parse::<usize>().ok().context(ParsingJsonNumberSnafu {}),
        _ => None.context(ParsingJsonNumberSnafu {}),
    }
}
