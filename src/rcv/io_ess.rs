use calamine::{open_workbook, Reader, Xlsx};
use log::debug;
use snafu::{OptionExt, ResultExt};

use crate::rcv::io_common::{make_default_id_lineno, split_marks};
use crate::rcv::*;

/// Reads votes recorded in the ES&S format (Excel spreadsheet). The last
/// column may carry a ballot weight.
pub fn read_excel_file(path: String, cfs: &FileSource) -> BRcvResult<Vec<ParsedBallot>> {
    let mut workbook: Xlsx<_> = open_workbook(path.clone()).context(OpeningExcelSnafu {
        path: path.clone(),
    })?;
    let wrange = match &cfs.excel_worksheet_name {
        Some(name) => workbook
            .worksheet_range(name)
            .context(EmptyExcelSnafu {})?
            .context(OpeningExcelSnafu { path: path.clone() })?,
        None => workbook
            .worksheet_range_at(0)
            .context(EmptyExcelSnafu {})?
            .context(OpeningExcelSnafu { path: path.clone() })?,
    };

    let default_id = make_default_id_lineno(&path);
    let delimiter = cfs.overvote_delimiter.as_deref();

    let header = wrange.rows().next().context(EmptyExcelSnafu {})?;
    debug!("read_excel_file: header: {:?}", header);
    let start_range = cfs.first_vote_column()?;
    let precinct_idx_o = cfs.precinct_column()?;

    let mut iter = wrange.rows();
    iter.next();
    let mut res: Vec<ParsedBallot> = Vec::new();
    for (idx, row) in iter.enumerate() {
        let lineno = (idx + 2) as u64;
        if row.len() <= start_range {
            return Err(Box::new(RcvError::ExcelWrongCellType {
                lineno,
                content: format!("row with {} cells", row.len()),
            }));
        }
        let choices = &row[start_range..];
        let num_row_choices = choices.len();
        let mut cs: Vec<Vec<String>> = Vec::new();
        for (cell_idx, elt) in choices.iter().enumerate() {
            let bco = read_choice_cell(elt, cell_idx == num_row_choices - 1, lineno)?;
            if let Some(bc) = bco {
                cs.push(split_marks(&bc, delimiter));
            }
        }

        // The count, when present, sits in the last cell.
        let last_elt = choices.last().context(EmptyExcelSnafu {})?;
        let count: Option<u64> = match last_elt {
            calamine::DataType::Float(f) => Some(*f as u64),
            calamine::DataType::Int(i) => Some(*i as u64),
            calamine::DataType::String(_) => Some(1),
            calamine::DataType::Empty => Some(1),
            _ => {
                return Err(Box::new(RcvError::ExcelWrongCellType {
                    lineno,
                    content: format!("{:?}", last_elt),
                }));
            }
        };

        let precinct: Option<String> = match precinct_idx_o {
            Some(precinct_idx) => match row.get(precinct_idx) {
                Some(calamine::DataType::String(s)) if !s.trim().is_empty() => {
                    Some(s.trim().to_string())
                }
                _ => None,
            },
            None => None,
        };

        res.push(ParsedBallot {
            id: Some(default_id(idx)),
            count,
            precinct,
            choices: cs,
        });
    }
    Ok(res)
}

fn read_choice_cell(
    cell: &calamine::DataType,
    is_last_column: bool,
    lineno: u64,
) -> RcvResult<Option<String>> {
    match cell {
        calamine::DataType::String(s) => Ok(Some(s.clone())),
        calamine::DataType::Empty => Ok(Some("".to_string())),
        // The last column may contain the count in the ESS format -> drop
        // it in this case.
        calamine::DataType::Float(_) if is_last_column => Ok(None),
        calamine::DataType::Int(_) if is_last_column => Ok(None),
        _ => Err(RcvError::ExcelWrongCellType {
            lineno,
            content: format!("{:?}", cell),
        }),
    }
}
