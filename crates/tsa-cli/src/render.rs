use std::fmt::Write as _;

use tsa_core::{Application, ReleaseInfo, SponsorPage};
use tsa_sync::{Settings, SyncRunSummary};

const APPLIED_MARK: &str = "*";

fn cell(value: &str, width: usize) -> String {
    let count = value.chars().count();
    if count <= width {
        format!("{value:<width$}")
    } else {
        let mut cut: String = value.chars().take(width.saturating_sub(1)).collect();
        cut.push('~');
        cut
    }
}

/// Sponsor page as a fixed-width table. Applied rows carry a `*` marker.
pub fn sponsor_page(page: &SponsorPage) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} | {}",
        page.result_label(),
        if page.total_pages() == 0 {
            page.page_label()
        } else {
            format!("{} of {}", page.page_label(), page.total_pages())
        }
    );
    let _ = writeln!(
        out,
        "{:>6} {} {} {} {} {} {}",
        "#",
        " ",
        cell("Organisation", 40),
        cell("Town/City", 20),
        cell("County", 16),
        cell("Type & Rating", 24),
        "Route"
    );
    for row in &page.rows {
        let _ = writeln!(
            out,
            "{:>6} {} {} {} {} {} {}",
            row.row_number,
            if row.applied { APPLIED_MARK } else { " " },
            cell(&row.organisation_name, 40),
            cell(&row.town_city, 20),
            cell(&row.county, 16),
            cell(&row.type_and_rating, 24),
            row.route
        );
    }
    if page.has_prev() || page.has_next() {
        let mut nav = Vec::new();
        if let Some(prev) = page.prev_page() {
            nav.push(format!("--page {} for previous", prev + 1));
        }
        if let Some(next) = page.next_page() {
            nav.push(format!("--page {} for next", next + 1));
        }
        let _ = writeln!(out, "{}", nav.join(", "));
    }
    out
}

pub fn applications(apps: &[Application]) -> String {
    if apps.is_empty() {
        return "no applications recorded\n".to_string();
    }
    let mut out = String::new();
    for app in apps {
        let _ = writeln!(
            out,
            "[{}] {} | {} | {}",
            app.id,
            app.date.as_deref().unwrap_or("-"),
            app.role.as_deref().unwrap_or("-"),
            app.contact.as_deref().unwrap_or("-"),
        );
        if let Some(note) = app.note.as_deref().filter(|n| !n.is_empty()) {
            let _ = writeln!(out, "      {note}");
        }
    }
    out
}

pub fn settings(settings: &Settings) -> String {
    format!(
        "log_level: {}\nlog_rotation_limit: {}\ncheck_for_release: {}\n",
        settings.log_level, settings.log_rotation_limit, settings.check_for_release
    )
}

pub fn sync_summary(summary: &SyncRunSummary) -> String {
    format!(
        "sync complete: run_id={} downloaded={} rows={} columns={} db={}",
        summary.run_id, summary.downloaded, summary.rows_loaded, summary.columns, summary.db_path
    )
}

pub fn release_notice(release: &ReleaseInfo, current: &str) -> String {
    let mut out = format!("New version available: {} (current v{current})\n", release.tag);
    let _ = writeln!(
        out,
        "Download: {}",
        release.download_url.as_deref().unwrap_or(&release.html_url)
    );
    if !release.changelog.trim().is_empty() {
        let _ = writeln!(out, "\n{}", release.changelog.trim_end());
    }
    out
}

/// Last `lines` lines of `text`, or all of it.
pub fn tail(text: &str, lines: Option<usize>) -> &str {
    let Some(lines) = lines else { return text };
    let trimmed = text.trim_end_matches('\n');
    let mut seen = 0;
    for (idx, ch) in trimmed.char_indices().rev() {
        if ch == '\n' {
            seen += 1;
            if seen == lines {
                return &text[idx + 1..];
            }
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsa_core::SponsorRow;

    fn row(n: u64, org: &str, applied: bool) -> SponsorRow {
        SponsorRow {
            row_number: n,
            organisation_name: org.into(),
            town_city: "London".into(),
            county: String::new(),
            type_and_rating: "Worker (A rating)".into(),
            route: "Skilled Worker".into(),
            applied,
        }
    }

    #[test]
    fn sponsor_table_marks_applied_rows_and_navigation() {
        let page = SponsorPage {
            rows: vec![row(51, "Acme Ltd", true), row(52, "Beta Ltd", false)],
            total: 120,
            page: 1,
            page_size: 50,
        };
        let text = sponsor_page(&page);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "120 results | Page 2 of 3");
        assert!(lines[2].starts_with("    51 * Acme Ltd"));
        assert!(lines[3].starts_with("    52   Beta Ltd"));
        assert_eq!(lines[4], "--page 1 for previous, --page 3 for next");
    }

    #[test]
    fn long_cells_are_cut() {
        assert_eq!(cell("abcdef", 4), "abc~");
        assert_eq!(cell("ab", 4), "ab  ");
    }

    #[test]
    fn tail_keeps_last_lines() {
        let log = "one\ntwo\nthree\n";
        assert_eq!(tail(log, Some(2)), "two\nthree\n");
        assert_eq!(tail(log, Some(10)), log);
        assert_eq!(tail(log, None), log);
    }

    #[test]
    fn release_notice_prefers_installer() {
        let release = ReleaseInfo {
            tag: "v0.7.0".into(),
            html_url: "https://example.test/releases/v0.7.0".into(),
            download_url: None,
            changelog: "## Changes\n- faster sync\n".into(),
            published_at: None,
        };
        let text = release_notice(&release, "0.6.0");
        assert!(text.starts_with("New version available: v0.7.0 (current v0.6.0)"));
        assert!(text.contains("Download: https://example.test/releases/v0.7.0"));
        assert!(text.contains("- faster sync"));
    }
}
