use fgraph::analyzer::Analyzer;
use fgraph::binary::SymbolKind;

#[test]
fn test_analyzer_opens_own_binary() {
    let binary_path = env!("CARGO_BIN_EXE_fgraph");
    let analyzer = Analyzer::open(binary_path);
    assert!(analyzer.is_ok(), "Failed to open {binary_path}: {:?}", analyzer.err());
}

#[test]
fn test_main_resolves_both_ways() {
    let analyzer = Analyzer::open(env!("CARGO_BIN_EXE_fgraph")).unwrap();

    let main = analyzer.resolve_symbol("main").expect("main symbol");
    assert_eq!(main.kind, SymbolKind::Function);
    let address = main.value;

    let (symbols, offset) = analyzer.resolve_address(address).unwrap();
    assert_eq!(offset, 0);
    assert!(symbols.iter().any(|s| s.name == "main"));
    // Aliases may share the address, but the offset is exact
    assert!(analyzer.describe_address(address).ends_with("+0"));
    assert!(analyzer.describe_address(address + 1).ends_with("+1"));
}

#[test]
fn test_main_body_decodes() {
    let analyzer = Analyzer::open(env!("CARGO_BIN_EXE_fgraph")).unwrap();

    let range = analyzer.function_range("main").unwrap();
    assert!(!range.is_empty());

    let code = analyzer.function_instructions("main").unwrap();
    assert!(!code.instructions.is_empty());
    assert_eq!(code.instructions[0].address, range.low);
    // The decoded stream stays inside the function
    let last = code.instructions.last().unwrap();
    assert!(last.next_address() <= range.high);
}

#[test]
fn test_call_graph_on_main() {
    let analyzer = Analyzer::open(env!("CARGO_BIN_EXE_fgraph")).unwrap();

    let trees = analyzer.call_graph(&["main".to_string()], &[], 0);
    assert_eq!(trees.len(), 1);
    assert_eq!(trees[0].name, "main");
    assert!(trees[0].root);
    assert!(trees[0].children.is_empty());
}

#[test]
fn test_excluded_root_is_not_expanded() {
    let analyzer = Analyzer::open(env!("CARGO_BIN_EXE_fgraph")).unwrap();

    let trees = analyzer.call_graph(&["main".to_string()], &["ma*".to_string()], 3);
    assert_eq!(trees.len(), 1);
    assert!(trees[0].error.is_some());
    assert!(!trees[0].is_instrumentable());
}
