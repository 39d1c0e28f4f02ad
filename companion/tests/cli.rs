// Command-line contract of the companion binary.

use assert_cmd::Command;

#[test]
fn help_describes_both_modes() {
    let output = Command::cargo_bin("vmscope-companion")
        .unwrap()
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("--request"));
    assert!(text.contains("--focus"));
    assert!(text.contains("--keep-alive"));
    assert!(text.contains("--serve"));
}

#[test]
fn bad_request_id_is_a_usage_error() {
    let output = Command::cargo_bin("vmscope-companion")
        .unwrap()
        .arg("--request=zzzz")
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn triggered_run_prints_the_ready_line() {
    let output = Command::cargo_bin("vmscope-companion")
        .unwrap()
        .arg("--request=abcd1234")
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let ready = stdout
        .lines()
        .find(|l| l.starts_with("BEACON_READY:"))
        .expect("ready line missing");

    // BEACON_READY:<va>:SIZE:<bytes>:MAGIC:<request_id>:PAGES:<n>
    let parts: Vec<&str> = ready.split(':').collect();
    assert_eq!(parts.len(), 8);
    assert!(parts[1].starts_with("0x"));
    assert_eq!(parts[2], "SIZE");
    assert_eq!(parts[4], "MAGIC");
    assert_eq!(parts[5], "abcd1234");
    assert_eq!(parts[6], "PAGES");

    let size: usize = parts[3].parse().unwrap();
    let pages: usize = parts[7].parse().unwrap();
    assert_eq!(size, pages * 4096);
    assert!(pages >= 1);
}
