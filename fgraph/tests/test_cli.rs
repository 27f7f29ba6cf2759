//! Command-line behavior that needs no privileges

use std::process::{Command, Output};

use object::write::{Object, SectionKind, Symbol, SymbolFlags, SymbolScope, SymbolSection};

fn fgraph(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_fgraph"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to run fgraph")
}

/// `handler` calls `helper`; both set up a frame pointer
fn write_image() -> tempfile::NamedTempFile {
    let mut text = vec![0xcc; 0x30];
    #[rustfmt::skip]
    let handler = [
        0x55,                           // push %rbp
        0x48, 0x89, 0xe5,               // mov %rsp,%rbp
        0xe8, 0x07, 0x00, 0x00, 0x00,   // call helper
        0x5d,                           // pop %rbp
        0xc3,                           // ret
    ];
    let helper = [0x55, 0x48, 0x89, 0xe5, 0x5d, 0xc3];
    text[0x10..0x10 + handler.len()].copy_from_slice(&handler);
    text[0x20..0x20 + helper.len()].copy_from_slice(&helper);

    let mut obj = Object::new(object::BinaryFormat::Elf, object::Architecture::X86_64, object::Endianness::Little);
    let section = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    obj.append_section_data(section, &text, 16);
    for (name, value, size) in [("handler", 0x10, handler.len()), ("helper", 0x20, helper.len())] {
        obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value,
            size: size as u64,
            kind: object::SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(section),
            flags: SymbolFlags::None,
        });
    }

    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), obj.write().unwrap()).unwrap();
    file
}

#[test]
fn test_dry_run_lists_probes() {
    let image = write_image();
    let path = image.path().to_str().unwrap();
    let output = fgraph(&["--dry-run", "-q", path, "handler(fd=%rdi:s32)"]);

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("handler(0x10): fp=+4 rets=[+10]"), "{stdout}");
    assert!(stdout.contains("  helper(0x20): fp=+4 rets=[+5]"), "{stdout}");
    assert!(stdout.contains("handler+4"), "{stdout}");
    assert!(stdout.contains("(fd=%rdi:s32)"), "{stdout}");
    assert!(stdout.contains("helper+5"), "{stdout}");
    assert!(!stdout.contains("fgraph v"), "quiet run printed the banner");
}

#[test]
fn test_depth_zero_keeps_roots_only() {
    let image = write_image();
    let output = fgraph(&["--dry-run", "-q", "-d", "0", image.path().to_str().unwrap(), "handler"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!stdout.contains("helper"), "{stdout}");
}

#[test]
fn test_missing_pattern_is_usage_error() {
    let output = fgraph(&["./server"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_missing_binary() {
    let output = fgraph(&["--dry-run", "/nonexistent/fgraph-target", "main"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to analyze"));
}

#[test]
fn test_unmatched_pattern() {
    let image = write_image();
    let output = fgraph(&["--dry-run", image.path().to_str().unwrap(), "no_such_function"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("No function"));
}

#[test]
fn test_malformed_pattern_is_usage_error() {
    let image = write_image();
    let output = fgraph(&["--dry-run", image.path().to_str().unwrap(), "handler", "!"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid pattern"));
}
