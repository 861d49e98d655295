//! ローダーとシンボルテーブルのテスト
//!
//! テストバイナリ自身（デバッグビルド）を読み込んで検証する。

use qdb_dwarf::{DwarfLoader, SymbolTable};

#[inline(never)]
fn marker_function_for_lookup() -> u64 {
    std::hint::black_box(0x5157_4442)
}

fn own_table() -> SymbolTable {
    let exe = std::env::current_exe().expect("current_exe");
    SymbolTable::load(exe).expect("Failed to load symbols from the test binary")
}

#[test]
fn test_load_own_binary() {
    let exe = std::env::current_exe().unwrap();
    let loader = DwarfLoader::load(&exe).expect("Failed to load test binary");

    assert_eq!(loader.path(), exe.as_path());
    assert_ne!(loader.entry(), 0);
    assert!(loader.dwarf().is_ok());
}

#[test]
fn test_resolve_and_reverse_resolve() {
    assert_eq!(marker_function_for_lookup(), 0x5157_4442);
    let table = own_table();

    let found = table.find_symbols("marker_function_for_lookup");
    assert!(!found.is_empty(), "Should find the marker function");

    let sym = found[0].clone();
    assert_eq!(table.resolve(&sym.name), Some(sym.address));
    assert_eq!(table.resolve(&sym.demangled_name), Some(sym.address));

    let back = table.reverse_resolve(sym.address).expect("reverse resolve");
    assert_eq!(back.address, sym.address);
}

#[test]
fn test_module_name_matching() {
    let table = own_table();
    let name = table.name().to_string();

    assert!(table.matches_module(&name));
    assert!(!table.matches_module("definitely-not-this-module"));
}

#[test]
fn test_lines_for_own_function() {
    let table = own_table();
    let sym = table.find_symbols("marker_function_for_lookup")[0].clone();

    let lines = table.lines().expect("line provider");
    let info = lines.lookup(sym.address).expect("lookup").expect("line info");
    assert!(info.file.ends_with("test_loader.rs"), "unexpected file {}", info.file);
}

#[test]
fn test_missing_file() {
    assert!(DwarfLoader::load("/nonexistent/qdb/binary").is_err());
}

#[test]
fn test_debug_summarizes_table() {
    let table = own_table();
    let debug = format!("{:?}", table);
    assert!(debug.starts_with("SymbolTable {"));
    assert!(debug.contains(&format!("name: {:?}", table.name())));
    assert!(debug.contains("symbols: "));
}
