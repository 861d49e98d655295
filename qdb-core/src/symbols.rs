//! シンボル読み込みとモジュール管理
//!
//! シンボル読み込みはワーカースレッドで行い、結果を `SymbolsFuture` で待ちます。
//! 読み込んだテーブルは `ModuleSet` がロードバイアスと組にして保持します。

use crate::errors::ERR_SYMBOL_NOT_FOUND;
use crate::target::{resolve_program, split_command_line, SymbolScope, TargetDescriptor};
use anyhow::Result;
use qdb_dwarf::SymbolTable;
use qdb_target::Memory;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

const ELF_MAGIC: [u8; 4] = *b"\x7fELF";

/// 共有ライブラリの標準的な検索ディレクトリ
const LIBRARY_DIRS: &[&str] = &[
    "/lib/x86_64-linux-gnu",
    "/usr/lib/x86_64-linux-gnu",
    "/lib64",
    "/usr/lib64",
    "/lib",
    "/usr/lib",
    "/usr/local/lib",
];

/// 読み込み結果
#[derive(Debug, Default)]
pub struct LoadedSymbols {
    pub tables: Vec<SymbolTable>,
    /// 読み込めなかったモジュールについての警告
    pub warnings: Vec<String>,
}

impl LoadedSymbols {
    /// ファイルを読み込み、失敗したものは警告に積む
    fn load(&mut self, path: &Path) {
        match SymbolTable::load(path) {
            Ok(table) => self.tables.push(table),
            Err(e) => {
                tracing::debug!("symbol load failed for {}: {:#}", path.display(), e);
                self.warnings
                    .push(format!("Skipping symbols for {}: {:#}", path.display(), e));
            }
        }
    }
}

/// 非同期のシンボル読み込み
///
/// セッションはクエリを登録する前に `wait` で完了を待ちます。
pub struct SymbolsFuture {
    state: FutureState,
}

enum FutureState {
    Ready(Result<LoadedSymbols>),
    Pending(JoinHandle<Result<LoadedSymbols>>),
}

impl SymbolsFuture {
    /// 完了済みのフューチャー
    pub fn ready(result: Result<LoadedSymbols>) -> Self {
        Self {
            state: FutureState::Ready(result),
        }
    }

    /// ワーカースレッドで読み込みを実行する
    pub fn spawn<F>(load: F) -> Self
    where
        F: FnOnce() -> Result<LoadedSymbols> + Send + 'static,
    {
        let spawned = std::thread::Builder::new()
            .name("qdb-symbols".to_string())
            .spawn(load);

        match spawned {
            Ok(handle) => Self {
                state: FutureState::Pending(handle),
            },
            Err(e) => Self::ready(Err(anyhow::anyhow!("Failed to start symbol loader: {}", e))),
        }
    }

    /// 読み込みの完了を待つ
    pub fn wait(self) -> Result<LoadedSymbols> {
        match self.state {
            FutureState::Ready(result) => result,
            FutureState::Pending(handle) => handle
                .join()
                .map_err(|_| anyhow::anyhow!("Symbol loader thread panicked"))?,
        }
    }
}

/// 範囲指定に従ってシンボルテーブルを読み込む
///
/// 個々のモジュールが見つからない・読めない場合は警告に積んで読み飛ばします。
/// 起動ターゲットの `All` はプログラム本体のみで、共有ライブラリは
/// [`ModuleSet::add_mapped`] がクエリの配置時に読み込みます。
pub fn load_scope(target: &TargetDescriptor, scope: &SymbolScope) -> Result<LoadedSymbols> {
    let mut loaded = LoadedSymbols::default();
    let paths = match scope {
        SymbolScope::None => return Ok(loaded),
        SymbolScope::All => target_modules(target)?,
        SymbolScope::Named(names) => {
            let known = target_modules(target).unwrap_or_default();
            let mut paths = Vec::new();
            for name in names {
                match find_module(name, &known) {
                    Some(path) => paths.push(path),
                    None => loaded
                        .warnings
                        .push(format!("Module '{}' not found; its symbols will not be loaded", name)),
                }
            }
            paths
        }
    };

    for path in paths {
        loaded.load(&path);
    }
    Ok(loaded)
}

/// 起動前に分かっているターゲットのモジュール
///
/// 起動ならプログラム本体、アタッチなら実行可能マッピングを持つすべてのファイルです。
fn target_modules(target: &TargetDescriptor) -> Result<Vec<PathBuf>> {
    match target {
        TargetDescriptor::Launch { command_line } => {
            let argv = split_command_line(command_line)?;
            let program = argv
                .first()
                .ok_or_else(|| anyhow::anyhow!("Empty command line"))?;
            Ok(vec![canonical(resolve_program(program)?)])
        }
        TargetDescriptor::Attach { process_id } => Memory::new(*process_id).executable_files(),
    }
}

/// モジュール名からファイルを探す
///
/// パス、既知のモジュールのファイル名、ライブラリ検索ディレクトリの順に探します。
pub fn find_module(name: &str, known: &[PathBuf]) -> Option<PathBuf> {
    if name.contains('/') {
        let path = Path::new(name);
        return path.is_file().then(|| canonical(path.to_path_buf()));
    }

    if let Some(path) = known.iter().find(|p| file_name_matches(p, name)) {
        return Some(path.clone());
    }

    let ld_library_path = std::env::var("LD_LIBRARY_PATH").unwrap_or_default();
    let dirs = ld_library_path
        .split(':')
        .filter(|d| !d.is_empty())
        .chain(LIBRARY_DIRS.iter().copied())
        .map(Path::new);
    find_in_dirs(name, dirs)
}

/// 検索ディレクトリを順に見て、最初に見つかったELFファイルを返す
///
/// `libc.so` のようなリンカスクリプトは読み飛ばします。
fn find_in_dirs<'a>(name: &str, dirs: impl Iterator<Item = &'a Path>) -> Option<PathBuf> {
    for dir in dirs {
        for candidate in [name.to_string(), format!("lib{}.so", name), format!("{}.so", name)] {
            let path = dir.join(&candidate);
            if is_elf(&path) {
                return Some(canonical(path));
            }
        }

        // libc.so.6 のようなバージョン付きファイル
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        let mut versioned: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| file_name_matches(p, name) && is_elf(p))
            .collect();
        versioned.sort();
        if let Some(path) = versioned.into_iter().next() {
            return Some(canonical(path));
        }
    }
    None
}

/// ELFマジックで始まる通常ファイルか
fn is_elf(path: &Path) -> bool {
    let mut magic = [0u8; 4];
    path.is_file()
        && std::fs::File::open(path)
            .and_then(|mut file| file.read_exact(&mut magic))
            .is_ok()
        && magic == ELF_MAGIC
}

/// ファイル名が `name`、`name.so.*`、`libname.so.*` のいずれかか
fn file_name_matches(path: &Path, name: &str) -> bool {
    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    file_name == name
        || file_name.starts_with(&format!("{}.so.", name))
        || file_name.starts_with(&format!("lib{}.so.", name))
}

fn canonical(path: PathBuf) -> PathBuf {
    path.canonicalize().unwrap_or(path)
}

/// ロード済みモジュール
struct LoadedModule {
    table: SymbolTable,
    /// 実行時のロードバイアス（未マップならNone）
    bias: Option<u64>,
}

/// アドレスのシンボル表記
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbolized {
    pub module: String,
    pub symbol: String,
    pub offset: u64,
}

impl std::fmt::Display for Symbolized {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}!{}", self.module, self.symbol)?;
        if self.offset != 0 {
            write!(f, "+0x{:x}", self.offset)?;
        }
        Ok(())
    }
}

/// セッションで使うモジュールの集合
#[derive(Default)]
pub struct ModuleSet {
    modules: Vec<LoadedModule>,
}

impl ModuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// シンボルテーブルを追加する（同じファイルは1度だけ）
    pub fn add(&mut self, tables: Vec<SymbolTable>) {
        for table in tables {
            if self.modules.iter().any(|m| m.table.path() == table.path()) {
                continue;
            }
            let bias = (!table.is_pie()).then_some(0);
            self.modules.push(LoadedModule { table, bias });
        }
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// 実行中のプロセスのマッピングからロードバイアスを決める
    pub fn bind(&mut self, memory: &Memory) -> Result<()> {
        for module in self.modules.iter_mut().filter(|m| m.table.is_pie()) {
            module.bias = memory.load_bias(module.table.path())?;
            tracing::debug!(module = module.table.name(), bias = ?module.bias, "bound module");
        }
        Ok(())
    }

    /// プロセスにマップされているモジュールのうち、未読み込みのものを読み込む
    ///
    /// 読み込めなかったモジュールの警告を返します。ロードバイアスは `bind` で決まります。
    pub fn add_mapped(&mut self, memory: &Memory) -> Result<Vec<String>> {
        let mut loaded = LoadedSymbols::default();
        for path in memory.executable_files()? {
            if !self.paths().any(|known| known == path) {
                loaded.load(&path);
            }
        }
        tracing::debug!(modules = loaded.tables.len(), "loaded mapped modules");
        self.add(loaded.tables);
        Ok(loaded.warnings)
    }

    /// シンボル名を実行時アドレスに解決する
    ///
    /// `module!symbol` でモジュールを限定できます。限定しない場合は読み込み順に探します。
    pub fn resolve(&self, name: &str) -> Result<u64> {
        let (module_name, symbol) = match name.split_once('!') {
            Some((module, symbol)) => (Some(module), symbol),
            None => (None, name),
        };

        let mut candidates = self
            .modules
            .iter()
            .filter(|m| module_name.map_or(true, |n| m.table.matches_module(n)))
            .peekable();

        if candidates.peek().is_none() {
            return Err(match module_name {
                Some(module) => anyhow::anyhow!("Module '{}' has no loaded symbols", module),
                None => anyhow::anyhow!("{}: '{}' (no symbols loaded; see -loadsyms)", ERR_SYMBOL_NOT_FOUND, name),
            });
        }

        for module in candidates {
            if let Some(address) = module.table.resolve(symbol) {
                let bias = module
                    .bias
                    .ok_or_else(|| anyhow::anyhow!("Module '{}' is not mapped in the target", module.table.name()))?;
                return Ok(bias.wrapping_add(address));
            }
        }
        Err(anyhow::anyhow!("{}: '{}'", ERR_SYMBOL_NOT_FOUND, name))
    }

    /// アドレスを最も近いシンボルで表す
    pub fn symbolize(&self, addr: u64) -> Option<Symbolized> {
        self.lookup(addr).map(|(module, relative)| {
            let (symbol, offset) = module
                .table
                .reverse_resolve(relative)
                .map(|s| (s.display_name().to_string(), relative - s.address))
                .unwrap_or_else(|| ("<unknown>".to_string(), relative));
            Symbolized {
                module: module.table.name().to_string(),
                symbol,
                offset,
            }
        })
    }

    /// アドレスのソース行
    pub fn source_line(&self, addr: u64) -> Option<String> {
        let (module, relative) = self.lookup(addr)?;
        let lines = module.table.lines().ok()?;
        lines.lookup(relative).ok().flatten().map(|line| line.to_string())
    }

    /// アドレスを含むモジュールと、モジュール内の相対アドレス
    ///
    /// シンボルが見つかるモジュールのうち、最も近いシンボルを持つものを選びます。
    fn lookup(&self, addr: u64) -> Option<(&LoadedModule, u64)> {
        self.modules
            .iter()
            .filter_map(|m| {
                let relative = addr.checked_sub(m.bias?)?;
                let sym = m.table.reverse_resolve(relative)?;
                Some((m, relative, relative - sym.address))
            })
            .min_by_key(|(_, _, distance)| *distance)
            .map(|(m, relative, _)| (m, relative))
    }

    /// 読み込んだモジュールのパス
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.modules.iter().map(|m| m.table.path())
    }
}
