use std::path::Path;

fn simplify_file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(path)
        .to_string()
}

pub fn make_default_id_lineno(path: &str) -> impl Fn(usize) -> String {
    let simplified_file_name = simplify_file_name(path);
    move |lineno| format!("{}-{:08}", simplified_file_name, lineno)
}

/// Restricts a ballot identifier to `[A-Za-z0-9_.-]`, replacing anything
/// else with an underscore.
pub fn sanitize_id(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Splits one cell into its marks. An empty cell is a blank rank; a cell
/// with the overvote delimiter carries several marks at the same rank.
pub fn split_marks(cell: &str, overvote_delimiter: Option<&str>) -> Vec<String> {
    let cell = cell.trim();
    if cell.is_empty() {
        return Vec::new();
    }
    match overvote_delimiter {
        Some(delimiter) if cell.contains(delimiter) => cell
            .split(delimiter)
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect(),
        _ => vec![cell.to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ids_carry_the_file_name_and_line() {
        let make = make_default_id_lineno("/tmp/election/ballots.csv");
        assert_eq!(make(12), "ballots.csv-00000012");
    }

    #[test]
    fn sanitization_keeps_the_safe_alphabet() {
        assert_eq!(sanitize_id("ballots.csv-00000012"), "ballots.csv-00000012");
        assert_eq!(sanitize_id("ward 3/box#7"), "ward_3_box_7");
    }

    #[test]
    fn delimited_cells_split_into_marks() {
        assert_eq!(split_marks("  ", None), Vec::<String>::new());
        assert_eq!(split_marks("Alice", None), vec!["Alice"]);
        assert_eq!(split_marks("Alice", Some("|")), vec!["Alice"]);
        assert_eq!(
            split_marks("Alice|Bob", Some("|")),
            vec!["Alice", "Bob"]
        );
        assert_eq!(split_marks("Alice | ", Some("|")), vec!["Alice"]);
    }
}
