use synod_core::Severity;

#[test]
fn fail_on_exits_zero_when_no_matching_severity() {
    // Simulate: only info-level findings, threshold is error
    let findings = vec![Severity::Info, Severity::Info];
    let threshold = Severity::Error;

    let has_findings = findings.iter().any(|s| s.meets_threshold(threshold));
    assert!(!has_findings, "should not fail when no error-level findings");
}

#[test]
fn fail_on_exits_one_when_matching_severity_found() {
    // Simulate: error finding present, threshold is warning
    let findings = vec![Severity::Error, Severity::Info];
    let threshold = Severity::Warning;

    let has_findings = findings.iter().any(|s| s.meets_threshold(threshold));
    assert!(has_findings, "should fail when an error meets the warning threshold");
}

#[test]
fn fail_on_warning_catches_errors_and_warnings() {
    let threshold = Severity::Warning;

    assert!(Severity::Error.meets_threshold(threshold));
    assert!(Severity::Warning.meets_threshold(threshold));
    assert!(!Severity::Info.meets_threshold(threshold));
}
