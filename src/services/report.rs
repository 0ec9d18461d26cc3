use regex::Regex;

/// Figures pulled from the Yosys `stat` report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SynthesisStats {
    pub cells: Option<u64>,
    pub chip_area: Option<f64>,
}

/// Extracts result figures from captured tool output.
///
/// Patterns are compiled once at construction time. When a report repeats a figure (one
/// block per module, then the top), the last occurrence wins.
pub struct ReportParser {
    /// "Number of cells:   42" (classic `stat` layout)
    cells_pattern: Regex,

    /// "   42 cells" (newer `stat` layout)
    cells_suffix_pattern: Regex,

    /// "Chip area for module '\top': 123.45"
    area_pattern: Regex,

    /// "DRC violations: 3", printed by the generated Magic script
    drc_pattern: Regex,

    /// Netgen's "Final result: ..." line
    lvs_pattern: Regex,
}

impl ReportParser {
    pub fn new() -> Self {
        Self {
            cells_pattern: Regex::new(r"Number of cells:\s+(\d+)").expect("Invalid cells regex"),
            cells_suffix_pattern: Regex::new(r"(?m)^\s*(\d+)\s+cells\s*$")
                .expect("Invalid cells suffix regex"),
            area_pattern: Regex::new(r"Chip area for (?:top )?module '[^']*':\s*([0-9]+(?:\.[0-9]+)?)")
                .expect("Invalid area regex"),
            drc_pattern: Regex::new(r"DRC violations:\s*(\d+)").expect("Invalid DRC regex"),
            lvs_pattern: Regex::new(r"(?i)(Circuits match|Netlists match|Netlists do not match|Circuits do not match)")
                .expect("Invalid LVS regex"),
        }
    }

    pub fn synthesis_stats(&self, output: &str) -> SynthesisStats {
        let cells = last_capture(&self.cells_pattern, output)
            .or_else(|| last_capture(&self.cells_suffix_pattern, output))
            .and_then(|value| value.parse().ok());
        let chip_area = last_capture(&self.area_pattern, output).and_then(|value| value.parse().ok());

        tracing::debug!("Parsed synthesis stats - cells: {:?}, area: {:?}", cells, chip_area);
        SynthesisStats { cells, chip_area }
    }

    /// Violation count from the DRC script output, if it got that far.
    pub fn drc_violations(&self, output: &str) -> Option<u64> {
        last_capture(&self.drc_pattern, output).and_then(|value| value.parse().ok())
    }

    /// `Some(true)` when Netgen reports matching netlists, `None` without a verdict.
    pub fn lvs_match(&self, output: &str) -> Option<bool> {
        last_capture(&self.lvs_pattern, output)
            .map(|verdict| !verdict.to_ascii_lowercase().contains("do not"))
    }
}

impl Default for ReportParser {
    fn default() -> Self {
        Self::new()
    }
}

fn last_capture<'a>(pattern: &Regex, text: &'a str) -> Option<&'a str> {
    pattern
        .captures_iter(text)
        .last()
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}
