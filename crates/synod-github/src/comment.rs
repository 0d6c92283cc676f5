use std::path::Path;

use synod_core::{ConsensusFinding, ConsensusReview, Finding, Patch, PatchValidation, Severity, Verdict};

/// Per-severity display caps: errors 5, warnings 5, info 3.
const GROUPS: [(Severity, &str, usize); 3] = [
    (Severity::Error, "#### 🔴 Errors", 5),
    (Severity::Warning, "#### 🟡 Warnings", 5),
    (Severity::Info, "#### 🔵 Info", 3),
];

/// Hidden HTML marker embedded in every bot comment.
///
/// Scanning for the marker before posting makes comment delivery
/// idempotent across stage retries.
///
/// # Examples
///
/// ```
/// use synod_github::comment::idempotency_marker;
///
/// let marker = idempotency_marker("job-ab12cd", "commenting");
/// assert_eq!(marker, "<!-- synod:job-ab12cd:commenting -->");
/// ```
pub fn idempotency_marker(job_id: &str, stage: &str) -> String {
    format!("<!-- synod:{job_id}:{stage} -->")
}

/// Render the full review comment: verdict, findings grouped by severity,
/// patch outcomes, and the fix-PR link when one was opened.
pub fn render_review_comment(
    marker: &str,
    review: &ConsensusReview,
    patches: &[Patch],
    fix_pr_url: Option<&str>,
) -> String {
    let mut md = String::new();
    md.push_str(marker);
    md.push_str("\n## 🤖 Synod Review\n\n");
    md.push_str(verdict_line(review.verdict));
    md.push_str("\n\n");
    md.push_str(&format!(
        "*{} of {} models responded.*\n\n",
        review.models_responded, review.models_queried
    ));

    if review.findings.is_empty() {
        md.push_str("### ✅ No issues found\n\n");
    } else {
        md.push_str(&format!("### 📋 Findings ({})\n\n", review.findings.len()));
        let lines: Vec<(Severity, String)> = review
            .findings
            .iter()
            .map(|f| (f.severity, consensus_line(f)))
            .collect();
        push_severity_groups(&mut md, &lines);
    }

    if !patches.is_empty() {
        md.push_str("### 🔧 Automated fixes\n\n");
        for patch in patches {
            md.push_str(&patch_line(patch));
            md.push('\n');
        }
        md.push('\n');
    }
    if let Some(url) = fix_pr_url {
        md.push_str(&format!("The validated fixes are available in {url}.\n\n"));
    }

    md.push_str("---\n*Generated by Synod*");
    md
}

/// Render the analysis-only comment used when the AI review was
/// unavailable and the run finished degraded.
pub fn render_degraded_comment(marker: &str, findings: &[Finding]) -> String {
    let mut md = String::new();
    md.push_str(marker);
    md.push_str("\n## 🤖 Synod Review\n\n");
    md.push_str(
        "> ⚠️ Partial results: the AI review was unavailable for this run. \
         The findings below come from static analysis only.\n\n",
    );

    if findings.is_empty() {
        md.push_str("### ✅ No issues found\n\n");
    } else {
        md.push_str(&format!("### 📋 Findings ({})\n\n", findings.len()));
        let lines: Vec<(Severity, String)> = findings
            .iter()
            .map(|f| {
                let line = format!(
                    "- **{}**: {} `[{}]`",
                    location(&f.file_path, f.start_line, f.end_line),
                    f.message,
                    f.source
                );
                (f.severity, line)
            })
            .collect();
        push_severity_groups(&mut md, &lines);
    }

    md.push_str("---\n*Generated by Synod*");
    md
}

/// Minimal status comment for a run that failed outright. Never carries
/// internal error text.
pub fn render_failure_comment(marker: &str) -> String {
    format!(
        "{marker}\n## 🤖 Synod Review\n\n\
         ⚠️ The automated review could not be completed for this push. \
         It will run again on the next update to this pull request.\n"
    )
}

/// Map the run outcome to a check-run conclusion.
///
/// `None` verdict means the run failed before producing a review.
///
/// # Examples
///
/// ```
/// use synod_core::Verdict;
/// use synod_github::comment::check_conclusion;
///
/// assert_eq!(check_conclusion(Some(Verdict::Approve), false), "success");
/// assert_eq!(check_conclusion(Some(Verdict::Approve), true), "neutral");
/// assert_eq!(check_conclusion(None, false), "failure");
/// ```
pub fn check_conclusion(verdict: Option<Verdict>, degraded: bool) -> &'static str {
    match verdict {
        None => "failure",
        Some(_) if degraded => "neutral",
        Some(Verdict::Approve) => "success",
        Some(Verdict::CommentOnly) => "neutral",
        Some(Verdict::RequestChanges) => "failure",
    }
}

fn verdict_line(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Approve => "**Verdict:** ✅ Approve",
        Verdict::RequestChanges => "**Verdict:** 🛑 Request changes",
        Verdict::CommentOnly => "**Verdict:** 💬 Comment only",
    }
}

fn consensus_line(finding: &ConsensusFinding) -> String {
    let mut line = format!(
        "- **{}**: {}",
        location(&finding.file_path, finding.start_line, finding.end_line),
        finding.message
    );
    if finding.agreement_count > 1 {
        line.push_str(&format!(" *({} models)*", finding.agreement_count));
    }
    line
}

fn patch_line(patch: &Patch) -> String {
    let loc = location(
        &patch.finding.file_path,
        patch.finding.start_line,
        patch.finding.end_line,
    );
    let msg = &patch.finding.message;
    match patch.validation {
        PatchValidation::Passed => format!("- ✅ `{loc}` {msg} (tests passed)"),
        PatchValidation::Failed => match &patch.execution {
            Some(exec) if exec.timed_out => format!("- ❌ `{loc}` {msg} (tests timed out)"),
            Some(_) => format!("- ❌ `{loc}` {msg} (tests failed)"),
            None => format!("- ❌ `{loc}` {msg} (patch did not apply)"),
        },
        PatchValidation::Skipped | PatchValidation::Pending => {
            format!("- ⏭️ `{loc}` {msg} (not validated)")
        }
    }
}

fn push_severity_groups(md: &mut String, lines: &[(Severity, String)]) {
    for (severity, heading, cap) in GROUPS {
        let group: Vec<&str> = lines
            .iter()
            .filter(|(s, _)| *s == severity)
            .map(|(_, line)| line.as_str())
            .collect();
        if group.is_empty() {
            continue;
        }
        md.push_str(&format!("{heading} ({})\n", group.len()));
        for line in group.iter().take(cap) {
            md.push_str(line);
            md.push('\n');
        }
        if group.len() > cap {
            md.push_str(&format!("- ...and {} more\n", group.len() - cap));
        }
        md.push('\n');
    }
}

fn location(path: &Path, start: u32, end: u32) -> String {
    if end > start {
        format!("{}:{start}-{end}", path.display())
    } else {
        format!("{}:{start}", path.display())
    }
}
