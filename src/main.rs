use std::env;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use crossterm::event::{self, Event as CEvent, KeyCode, KeyEvent, KeyModifiers};
use log::{error, info, warn};
use rand::Rng;
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
    Frame, Terminal,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// ---------------------------
///// === CONFIGURATION ===
/// ---------------------------
const DATA_DIR_PATH: &str = "~/.grow_steps/";
const DATA_FILE_NAME: &str = "entries.json";
const MAX_MICRO_STEPS: usize = 5;

const LOGO: &str = r#"┏━╸┏━┓┏━┓╻ ╻   ┏━┓╺┳╸┏━╸┏━┓┏━┓
┃╺┓┣┳┛┃ ┃┃╻┃   ┗━┓ ┃ ┣╸ ┣━┛┗━┓
┗━┛╹┗╸┗━┛┗┻┛╺━╸┗━┛ ╹ ┗━╸╹  ┗━┛"#;

/// Normalize the configured data directory string into an absolute PathBuf.
/// "~/<rest>" expands to $HOME/<rest>; anything not absolute is treated as
/// absolute by prefixing '/'.
fn normalize_data_dir<P: AsRef<str>>(s: P) -> PathBuf {
    let s = s.as_ref().trim();
    if s.is_empty() {
        return env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    }

    if s == "~" {
        if let Ok(home) = env::var("HOME") {
            return PathBuf::from(home);
        }
    } else if let Some(rest) = s.strip_prefix("~/") {
        if let Ok(home) = env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }

    let p = PathBuf::from(s);
    if p.is_absolute() {
        return p;
    }
    PathBuf::from("/").join(s.trim_start_matches("./"))
}

/// ---------------------------
///// === DATA MODELS ===
/// ---------------------------

/// Paired internal/external free-text fields, used for both obstacles and
/// their countermeasures. No cross-validation between the pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct FactorPair {
    internal: String,
    external: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Reflection {
    completed: bool,
    learnings: String,
    feelings: String,
    next_steps: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    ai_feedback: Option<String>,
}

/// One persisted journal record. Every field is serde-defaulted so a shape
/// change reads back as missing values instead of failing the whole file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Entry {
    id: String,
    date: String, // "YYYY-MM-DD"
    category: String,
    title: String,
    priority_task: String,
    status: String,
    available_time: String,
    obstacles: FactorPair,
    actions: FactorPair,
    micro_steps: Vec<String>,
    smart_plan: String,
    reflection: Reflection,
}

impl Entry {
    /// Fresh draft. The id and date are fixed here, at wizard start, not at
    /// submission: a form begun before midnight keeps the earlier date
    /// (session-start semantics).
    fn new_draft() -> Self {
        Entry {
            id: Uuid::new_v4().to_string(),
            date: Local::now().format("%Y-%m-%d").to_string(),
            micro_steps: vec![String::new()],
            ..Default::default()
        }
    }
}

/// Partial top-level update for `EntryStore::update`. Merging is shallow by
/// contract: a supplied `reflection` replaces the stored one wholly, so a
/// partial reflection update is unrepresentable.
#[derive(Debug, Clone, Default)]
struct EntryPatch {
    category: Option<String>,
    title: Option<String>,
    priority_task: Option<String>,
    status: Option<String>,
    available_time: Option<String>,
    obstacles: Option<FactorPair>,
    actions: Option<FactorPair>,
    micro_steps: Option<Vec<String>>,
    smart_plan: Option<String>,
    reflection: Option<Reflection>,
}

/// ---------------------------
///// === ENTRY STORE ===
/// ---------------------------

/// Owns the canonical entry list. Insertion order is display order, newest
/// first. Every mutating call rewrites the whole data file before returning.
struct EntryStore {
    entries: Vec<Entry>,
    data_file_path: PathBuf,
}

impl EntryStore {
    fn load(dir: impl AsRef<Path>, data_filename: &str) -> Result<Self> {
        let dir = dir.as_ref().to_owned();
        let data_file_path = dir.join(data_filename);

        fs::create_dir_all(&dir)
            .with_context(|| format!("couldn't create data dir {:?}", dir))?;

        let entries: Vec<Entry> = if data_file_path.exists() {
            let mut f = File::open(&data_file_path)
                .with_context(|| format!("failed to open data file {:?}", data_file_path))?;
            let mut s = String::new();
            f.read_to_string(&mut s).with_context(|| "failed to read data file")?;
            match serde_json::from_str(&s) {
                Ok(v) => v,
                Err(e) => {
                    // Malformed history is discarded, never surfaced.
                    warn!("data file {:?} is malformed ({}); starting empty", data_file_path, e);
                    Vec::new()
                }
            }
        } else {
            let s = serde_json::to_string_pretty(&Vec::<Entry>::new())
                .context("serialize empty entry list")?;
            let mut f = File::create(&data_file_path)
                .with_context(|| format!("failed to create data file {:?}", data_file_path))?;
            f.write_all(s.as_bytes())
                .with_context(|| "failed to write default data file")?;
            Vec::new()
        };

        Ok(Self { entries, data_file_path })
    }

    /// Write the whole list to a temp file and atomically rename.
    fn persist(&self) -> Result<()> {
        let tmp = self.data_file_path.with_extension("json.tmp");
        let mut f = File::create(&tmp)
            .with_context(|| format!("failed to create temp file {:?}", tmp))?;
        let s = serde_json::to_string_pretty(&self.entries)
            .context("failed to serialize entry list")?;
        f.write_all(s.as_bytes())
            .with_context(|| "failed writing serialized entries to temp file")?;
        fs::rename(&tmp, &self.data_file_path)
            .with_context(|| "failed to rename temp data file")?;
        Ok(())
    }

    /// Prepend `entry` so it becomes the most recent. No uniqueness check on
    /// id; the wizard generates a collision-free UUID.
    fn add(&mut self, entry: Entry) -> Result<()> {
        self.entries.insert(0, entry);
        self.persist()
    }

    /// Shallow-merge `patch` into the entry with `id`. Unknown id is a no-op.
    fn update(&mut self, id: &str, patch: EntryPatch) -> Result<()> {
        let entry = match self.entries.iter_mut().find(|e| e.id == id) {
            Some(e) => e,
            None => return Ok(()),
        };
        if let Some(v) = patch.category {
            entry.category = v;
        }
        if let Some(v) = patch.title {
            entry.title = v;
        }
        if let Some(v) = patch.priority_task {
            entry.priority_task = v;
        }
        if let Some(v) = patch.status {
            entry.status = v;
        }
        if let Some(v) = patch.available_time {
            entry.available_time = v;
        }
        if let Some(v) = patch.obstacles {
            entry.obstacles = v;
        }
        if let Some(v) = patch.actions {
            entry.actions = v;
        }
        if let Some(v) = patch.micro_steps {
            entry.micro_steps = v;
        }
        if let Some(v) = patch.smart_plan {
            entry.smart_plan = v;
        }
        if let Some(v) = patch.reflection {
            entry.reflection = v;
        }
        self.persist()
    }

    /// Remove the entry with `id` if present. Unknown id is a no-op.
    fn delete(&mut self, id: &str) -> Result<()> {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        if self.entries.len() == before {
            return Ok(());
        }
        self.persist()
    }
}

/// ---------------------------
///// === WIZARD STATE MACHINE ===
/// ---------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Stage {
    Intro,
    BasicInfo,
    CurrentState,
    ObstaclesAndActions,
    MicroSteps,
    SmartPlan,
    Review,
    Done,
}

impl Stage {
    /// Forward chain Intro -> ... -> Review. Review only exits via submit,
    /// Done only via reset.
    fn next(self) -> Stage {
        match self {
            Stage::Intro => Stage::BasicInfo,
            Stage::BasicInfo => Stage::CurrentState,
            Stage::CurrentState => Stage::ObstaclesAndActions,
            Stage::ObstaclesAndActions => Stage::MicroSteps,
            Stage::MicroSteps => Stage::SmartPlan,
            Stage::SmartPlan => Stage::Review,
            Stage::Review => Stage::Review,
            Stage::Done => Stage::Done,
        }
    }
    fn prev(self) -> Stage {
        match self {
            Stage::Intro => Stage::Intro,
            Stage::BasicInfo => Stage::Intro,
            Stage::CurrentState => Stage::BasicInfo,
            Stage::ObstaclesAndActions => Stage::CurrentState,
            Stage::MicroSteps => Stage::ObstaclesAndActions,
            Stage::SmartPlan => Stage::MicroSteps,
            Stage::Review => Stage::SmartPlan,
            Stage::Done => Stage::Done,
        }
    }

    fn index(self) -> usize {
        match self {
            Stage::Intro => 0,
            Stage::BasicInfo => 1,
            Stage::CurrentState => 2,
            Stage::ObstaclesAndActions => 3,
            Stage::MicroSteps => 4,
            Stage::SmartPlan => 5,
            Stage::Review => 6,
            Stage::Done => 7,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Stage::Intro => "準備",
            Stage::BasicInfo => "基本情報",
            Stage::CurrentState => "現状",
            Stage::ObstaclesAndActions => "障害と対策",
            Stage::MicroSteps => "行動手順",
            Stage::SmartPlan => "行動計画",
            Stage::Review => "確認・修正",
            Stage::Done => "完了",
        }
    }
}

/// Accumulates a draft entry across the fixed stage sequence. Advancement is
/// never gated on input: required-field markers are advisory rendering only.
struct WizardState {
    stage: Stage,
    draft: Entry,
    /// Focused input within the current stage.
    field: usize,
}

impl WizardState {
    fn new() -> Self {
        Self {
            stage: Stage::Intro,
            draft: Entry::new_draft(),
            field: 0,
        }
    }

    fn field_count(&self) -> usize {
        match self.stage {
            Stage::BasicInfo => 2,
            Stage::CurrentState => 3,
            Stage::ObstaclesAndActions => 4,
            Stage::MicroSteps => self.draft.micro_steps.len(),
            Stage::SmartPlan => 1,
            _ => 0,
        }
    }

    fn focused_input_mut(&mut self) -> Option<&mut String> {
        match (self.stage, self.field) {
            (Stage::BasicInfo, 0) => Some(&mut self.draft.category),
            (Stage::BasicInfo, 1) => Some(&mut self.draft.title),
            (Stage::CurrentState, 0) => Some(&mut self.draft.priority_task),
            (Stage::CurrentState, 1) => Some(&mut self.draft.status),
            (Stage::CurrentState, 2) => Some(&mut self.draft.available_time),
            (Stage::ObstaclesAndActions, 0) => Some(&mut self.draft.obstacles.internal),
            (Stage::ObstaclesAndActions, 1) => Some(&mut self.draft.actions.internal),
            (Stage::ObstaclesAndActions, 2) => Some(&mut self.draft.obstacles.external),
            (Stage::ObstaclesAndActions, 3) => Some(&mut self.draft.actions.external),
            (Stage::MicroSteps, i) => self.draft.micro_steps.get_mut(i),
            (Stage::SmartPlan, 0) => Some(&mut self.draft.smart_plan),
            _ => None,
        }
    }

    fn next(&mut self) {
        self.stage = self.stage.next();
        self.field = 0;
    }

    fn prev(&mut self) {
        self.stage = self.stage.prev();
        self.field = 0;
    }

    /// Direct correction jump, offered only from the review screen and only
    /// into the input stages; the forward chain resumes from there.
    fn jump_to(&mut self, stage: Stage) {
        if self.stage != Stage::Review {
            return;
        }
        if matches!(
            stage,
            Stage::BasicInfo
                | Stage::CurrentState
                | Stage::ObstaclesAndActions
                | Stage::MicroSteps
                | Stage::SmartPlan
        ) {
            self.stage = stage;
            self.field = 0;
        }
    }

    /// Bounded at MAX_MICRO_STEPS; beyond that appending is a no-op.
    fn add_micro_step(&mut self) {
        if self.draft.micro_steps.len() < MAX_MICRO_STEPS {
            self.draft.micro_steps.push(String::new());
            self.field = self.draft.micro_steps.len() - 1;
        }
    }

    fn update_micro_step(&mut self, index: usize, value: String) {
        if let Some(s) = self.draft.micro_steps.get_mut(index) {
            *s = value;
        }
    }

    /// The first step is always present: editable, never removable. Removal
    /// elsewhere shifts later steps down by one.
    fn remove_micro_step(&mut self, index: usize) {
        if index == 0 || index >= self.draft.micro_steps.len() {
            return;
        }
        self.draft.micro_steps.remove(index);
        if self.field >= self.draft.micro_steps.len() {
            self.field = self.draft.micro_steps.len() - 1;
        }
    }

    /// Freeze the draft into an immutable entry and hand it to the store.
    /// Only valid from the review screen.
    fn submit(&mut self, store: &mut EntryStore) -> Result<()> {
        if self.stage != Stage::Review {
            return Ok(());
        }
        store.add(self.draft.clone())?;
        info!("recorded entry {}", self.draft.id);
        self.stage = Stage::Done;
        Ok(())
    }
}

/// ---------------------------
///// === FEEDBACK GENERATOR ===
/// ---------------------------

/// The trimmed reflection triple as submitted by the user.
struct ReflectionInput {
    learnings: String,
    feelings: String,
    next_steps: String,
}

/// Template selection goes through this seam so tests can pin the pick.
trait TemplateChooser {
    fn choose(&mut self, len: usize) -> usize;
}

struct RandomChooser;

impl TemplateChooser for RandomChooser {
    fn choose(&mut self, len: usize) -> usize {
        rand::thread_rng().gen_range(0..len)
    }
}

/// Templated pseudo-feedback: the reflection text is interpolated verbatim
/// into one of four fixed sentences picked uniformly at random. No analysis
/// happens here; the "AI" label is presentational only.
fn generate_feedback(chooser: &mut dyn TemplateChooser, input: &ReflectionInput) -> String {
    let ReflectionInput { learnings, feelings, next_steps } = input;
    let templates = [
        format!("「{learnings}」という気づきは非常に価値があります。「{feelings}」という感情は成長の証です。次のステップ「{next_steps}」を実行することで、さらなる飛躍が期待できます。"),
        format!("「{learnings}」という学びを得られたこと自体が大きな前進です。感情面では「{feelings}」と感じているとのこと、そのリアルな手応えを次回の計画「{next_steps}」に活かしましょう。"),
        format!("あなたの振り返りから一つ核心を言うと：「{learnings}」という洞察は、まさに成長の本質です。「{next_steps}」という次の一手を、迷わず実行してください。"),
        format!("「{feelings}」という感想は正直で良いですね。「{learnings}」という学びを武器に、次の行動「{next_steps}」に向けて、また最速最小の一歩を踏み出しましょう。"),
    ];
    let idx = chooser.choose(templates.len());
    templates[idx].clone()
}

/// ---------------------------
///// === APP STATE ===
/// ---------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum View {
    Wizard,
    History,
}

impl View {
    fn next(self) -> View {
        match self {
            View::Wizard => View::History,
            View::History => View::Wizard,
        }
    }
    fn prev(self) -> View {
        self.next()
    }
}

struct AppState {
    store: EntryStore,
    view: View,
    wizard: WizardState,
    // history browser scratch
    cursor: usize,
    expanded_id: Option<String>,
    delete_arm_id: Option<String>,
    reflection_id: Option<String>,
    refl_fields: [String; 3],
    refl_field: usize,
    notice: Option<String>,
    chooser: Box<dyn TemplateChooser>,
}

impl AppState {
    fn new(store: EntryStore) -> Self {
        Self {
            store,
            view: View::Wizard,
            wizard: WizardState::new(),
            cursor: 0,
            expanded_id: None,
            delete_arm_id: None,
            reflection_id: None,
            refl_fields: Default::default(),
            refl_field: 0,
            notice: None,
            chooser: Box::new(RandomChooser),
        }
    }

    fn entry_under_cursor(&self) -> Option<&Entry> {
        self.store.entries.get(self.cursor)
    }

    /// At most one entry is expanded; selecting it again collapses it.
    fn toggle_expand(&mut self) {
        let id = match self.entry_under_cursor() {
            Some(e) => e.id.clone(),
            None => return,
        };
        if self.expanded_id.as_deref() == Some(id.as_str()) {
            self.expanded_id = None;
        } else {
            self.expanded_id = Some(id);
        }
    }

    /// Arm the delete confirmation for the entry under the cursor. Only one
    /// confirmation may be armed at a time.
    fn arm_delete(&mut self) {
        if let Some(e) = self.entry_under_cursor() {
            self.delete_arm_id = Some(e.id.clone());
        }
    }

    fn cancel_delete(&mut self) {
        self.delete_arm_id = None;
    }

    fn confirm_delete(&mut self) -> Result<()> {
        let id = match self.delete_arm_id.take() {
            Some(id) => id,
            None => return Ok(()),
        };
        self.store.delete(&id)?;
        if self.expanded_id.as_deref() == Some(id.as_str()) {
            self.expanded_id = None;
        }
        if self.cursor >= self.store.entries.len() {
            self.cursor = self.store.entries.len().saturating_sub(1);
        }
        Ok(())
    }

    /// Open the reflection dialog with empty scratch fields, independent of
    /// any prior values. Completed entries are never reopened.
    fn open_reflection(&mut self) {
        let entry = match self.entry_under_cursor() {
            Some(e) => e,
            None => return,
        };
        if entry.reflection.completed {
            self.notice = Some("この記録は振り返り済みです".to_string());
            return;
        }
        self.reflection_id = Some(entry.id.clone());
        self.refl_fields = Default::default();
        self.refl_field = 0;
        self.notice = None;
    }

    /// Dismissing the dialog discards the scratch input.
    fn close_reflection(&mut self) {
        self.reflection_id = None;
        self.notice = None;
    }

    /// Validate, generate feedback, and merge the completed reflection into
    /// the entry. All three fields must be non-empty after trimming; a miss
    /// is a blocking notice with no state change.
    fn submit_reflection(&mut self) -> Result<()> {
        let id = match &self.reflection_id {
            Some(id) => id.clone(),
            None => return Ok(()),
        };
        let learnings = self.refl_fields[0].trim().to_string();
        let feelings = self.refl_fields[1].trim().to_string();
        let next_steps = self.refl_fields[2].trim().to_string();
        if learnings.is_empty() || feelings.is_empty() || next_steps.is_empty() {
            self.notice = Some("全ての項目を入力してください".to_string());
            return Ok(());
        }

        let input = ReflectionInput {
            learnings: learnings.clone(),
            feelings: feelings.clone(),
            next_steps: next_steps.clone(),
        };
        let ai_feedback = generate_feedback(self.chooser.as_mut(), &input);

        self.store.update(
            &id,
            EntryPatch {
                reflection: Some(Reflection {
                    completed: true,
                    learnings,
                    feelings,
                    next_steps,
                    ai_feedback: Some(ai_feedback),
                }),
                ..Default::default()
            },
        )?;
        self.reflection_id = None;
        self.notice = None;
        Ok(())
    }

    /// Route pasted text into whichever input currently has focus.
    fn paste(&mut self, s: &str) {
        if self.view == View::Wizard {
            if let Some(buf) = self.wizard.focused_input_mut() {
                buf.push_str(s);
            }
        } else if self.reflection_id.is_some() {
            self.refl_fields[self.refl_field].push_str(s);
        }
    }
}

/// ---------------------------
///// === UI / Main Loop ===
/// ---------------------------

fn main() -> Result<()> {
    env_logger::Builder::from_default_env().format_timestamp(None).init();

    let data_dir = normalize_data_dir(DATA_DIR_PATH);
    let store = EntryStore::load(&data_dir, DATA_FILE_NAME)
        .with_context(|| "failed to load entry store")?;
    info!("loaded {} entries from {:?}", store.entries.len(), data_dir);

    let mut app = AppState::new(store);

    crossterm::terminal::enable_raw_mode().context("enable raw mode")?;
    let stdout = io::stdout();
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();
    terminal.hide_cursor().ok();

    let res = run_app(&mut terminal, &mut app);

    crossterm::terminal::disable_raw_mode().ok();
    terminal.show_cursor().ok();

    if let Err(e) = res {
        error!("Application error: {:?}", e);
        Err(e)
    } else {
        Ok(())
    }
}

fn run_app(terminal: &mut Terminal<CrosstermBackend<io::Stdout>>, app: &mut AppState) -> Result<()> {
    loop {
        terminal.draw(|f| ui(f, app)).context("drawing UI frame")?;

        if event::poll(Duration::from_millis(200)).context("poll events")? {
            match event::read().context("read event")? {
                CEvent::Key(key) => {
                    // Ctrl+C quits
                    if let KeyEvent { code: KeyCode::Char('c'), modifiers: KeyModifiers::CONTROL, .. } = key {
                        break;
                    }

                    // Global Tab / BackTab switch views, unless a dialog is
                    // open in the history browser.
                    let dialog_open = app.reflection_id.is_some() || app.delete_arm_id.is_some();
                    if let KeyEvent { code: KeyCode::Tab, modifiers, .. } = key {
                        if !dialog_open {
                            if modifiers.contains(KeyModifiers::SHIFT) {
                                app.view = app.view.prev();
                            } else {
                                app.view = app.view.next();
                            }
                        }
                        continue;
                    }
                    if let KeyEvent { code: KeyCode::BackTab, .. } = key {
                        if !dialog_open {
                            app.view = app.view.prev();
                        }
                        continue;
                    }

                    handle_key_event(app, key)?;
                }
                CEvent::Paste(s) => {
                    app.paste(&s);
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// Dispatch a key to whichever view (and sub-dialog) is active.
fn handle_key_event(app: &mut AppState, key: KeyEvent) -> Result<()> {
    match app.view {
        View::Wizard => handle_wizard_key(app, key),
        View::History => handle_history_key(app, key),
    }
}

fn handle_wizard_key(app: &mut AppState, key: KeyEvent) -> Result<()> {
    match app.wizard.stage {
        Stage::Intro => {
            if key.code == KeyCode::Enter {
                app.wizard.next();
            }
        }
        Stage::Review => match key {
            KeyEvent { code: KeyCode::Enter, .. } => {
                app.wizard.submit(&mut app.store).with_context(|| "failed to record entry")?;
            }
            KeyEvent { code: KeyCode::Esc, .. } => app.wizard.prev(),
            KeyEvent { code: KeyCode::Char(c @ '1'..='5'), .. } => {
                let target = match c {
                    '1' => Stage::BasicInfo,
                    '2' => Stage::CurrentState,
                    '3' => Stage::ObstaclesAndActions,
                    '4' => Stage::MicroSteps,
                    _ => Stage::SmartPlan,
                };
                app.wizard.jump_to(target);
            }
            _ => {}
        },
        Stage::Done => {
            // Start over with a fresh draft and land in the history, the
            // place where the reflection gets written later.
            if key.code == KeyCode::Enter {
                app.wizard = WizardState::new();
                app.view = View::History;
            }
        }
        // input stages
        _ => match key {
            // Shift+Enter => newline in the focused field
            KeyEvent { code: KeyCode::Enter, modifiers, .. } if modifiers.contains(KeyModifiers::SHIFT) => {
                if let Some(buf) = app.wizard.focused_input_mut() {
                    buf.push('\n');
                }
            }
            KeyEvent { code: KeyCode::Enter, .. } => app.wizard.next(),
            KeyEvent { code: KeyCode::Esc, .. } => app.wizard.prev(),
            KeyEvent { code: KeyCode::Up, .. } => {
                if app.wizard.field > 0 {
                    app.wizard.field -= 1;
                }
            }
            KeyEvent { code: KeyCode::Down, .. } => {
                if app.wizard.field + 1 < app.wizard.field_count() {
                    app.wizard.field += 1;
                }
            }
            KeyEvent { code: KeyCode::Char('a'), modifiers, .. }
                if modifiers.contains(KeyModifiers::CONTROL) && app.wizard.stage == Stage::MicroSteps =>
            {
                app.wizard.add_micro_step();
            }
            KeyEvent { code: KeyCode::Char('d'), modifiers, .. }
                if modifiers.contains(KeyModifiers::CONTROL) && app.wizard.stage == Stage::MicroSteps =>
            {
                let idx = app.wizard.field;
                app.wizard.remove_micro_step(idx);
            }
            KeyEvent { code: KeyCode::Char(c), modifiers, .. } => {
                if !modifiers.contains(KeyModifiers::CONTROL) {
                    if let Some(buf) = app.wizard.focused_input_mut() {
                        buf.push(c);
                    }
                }
            }
            KeyEvent { code: KeyCode::Backspace, .. } => {
                if let Some(buf) = app.wizard.focused_input_mut() {
                    buf.pop();
                }
            }
            _ => {}
        },
    }
    Ok(())
}

fn handle_history_key(app: &mut AppState, key: KeyEvent) -> Result<()> {
    if app.reflection_id.is_some() {
        match key {
            KeyEvent { code: KeyCode::Esc, .. } => app.close_reflection(),
            KeyEvent { code: KeyCode::Char('s'), modifiers, .. } if modifiers.contains(KeyModifiers::CONTROL) => {
                app.submit_reflection().with_context(|| "failed to save reflection")?;
            }
            KeyEvent { code: KeyCode::Up, .. } => {
                if app.refl_field > 0 {
                    app.refl_field -= 1;
                }
            }
            KeyEvent { code: KeyCode::Down, .. } => {
                if app.refl_field + 1 < app.refl_fields.len() {
                    app.refl_field += 1;
                }
            }
            KeyEvent { code: KeyCode::Enter, modifiers, .. } if modifiers.contains(KeyModifiers::SHIFT) => {
                app.refl_fields[app.refl_field].push('\n');
            }
            KeyEvent { code: KeyCode::Enter, .. } => {
                if app.refl_field + 1 < app.refl_fields.len() {
                    app.refl_field += 1;
                }
            }
            KeyEvent { code: KeyCode::Char(c), modifiers, .. } => {
                if !modifiers.contains(KeyModifiers::CONTROL) {
                    app.refl_fields[app.refl_field].push(c);
                    app.notice = None;
                }
            }
            KeyEvent { code: KeyCode::Backspace, .. } => {
                app.refl_fields[app.refl_field].pop();
                app.notice = None;
            }
            _ => {}
        }
        return Ok(());
    }

    if app.delete_arm_id.is_some() {
        match key.code {
            KeyCode::Char('y') => app.confirm_delete().with_context(|| "failed to delete entry")?,
            KeyCode::Char('n') | KeyCode::Esc => app.cancel_delete(),
            _ => {}
        }
        return Ok(());
    }

    match key.code {
        KeyCode::Up => {
            if app.cursor > 0 {
                app.cursor -= 1;
            }
        }
        KeyCode::Down => {
            if app.cursor + 1 < app.store.entries.len() {
                app.cursor += 1;
            }
        }
        KeyCode::Enter => app.toggle_expand(),
        KeyCode::Char('d') => app.arm_delete(),
        KeyCode::Char('r') => app.open_reflection(),
        _ => {}
    }
    Ok(())
}

/// ---------------------------
///// === RENDERING ===
/// ---------------------------

/// Micro-steps may be stored empty; they are filtered at render time only.
fn nonempty_steps(steps: &[String]) -> Vec<&String> {
    steps.iter().filter(|s| !s.trim().is_empty()).collect()
}

fn dash_if_empty(s: &str) -> &str {
    if s.trim().is_empty() { "—" } else { s }
}

/// Render the UI with a 3-line header (logo left, date + live entry count on
/// the right bottom header row); the active view fills the rest.
fn ui<B: Backend>(f: &mut Frame<B>, app: &AppState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)].as_ref())
        .split(f.size());

    let header_rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(1), Constraint::Length(1), Constraint::Length(1)].as_ref())
        .split(chunks[0]);

    let mut left_cols = Vec::new();
    let mut right_cols = Vec::new();
    for row in header_rows.iter() {
        let cols = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)].as_ref())
            .split(*row);
        left_cols.push(cols[0]);
        right_cols.push(cols[1]);
    }

    let logo_lines: Vec<&str> = LOGO.lines().collect();
    for (i, col) in left_cols.iter().enumerate() {
        let text = logo_lines.get(i).copied().unwrap_or("");
        let p = Paragraph::new(Line::from(Span::raw(text))).block(Block::default());
        f.render_widget(p, *col);
    }

    let date_str = Local::now().format("%Y-%m-%d").to_string();
    let meta = format!("{} · {} 件の記録", date_str, app.store.entries.len());
    let meta_para = Paragraph::new(Line::from(Span::styled(
        meta,
        Style::default().add_modifier(Modifier::BOLD),
    )))
    .block(Block::default());
    if let Some(col) = right_cols.last() {
        f.render_widget(meta_para, *col);
    }

    match app.view {
        View::Wizard => draw_wizard(f, chunks[1], app),
        View::History => draw_history(f, chunks[1], app),
    }
}

/// Progress row across the six user-facing stages (done / active / pending).
fn progress_line(stage: Stage) -> Line<'static> {
    let steps = [
        Stage::BasicInfo,
        Stage::CurrentState,
        Stage::ObstaclesAndActions,
        Stage::MicroSteps,
        Stage::SmartPlan,
        Stage::Review,
    ];
    let mut spans: Vec<Span> = Vec::new();
    for (i, s) in steps.iter().enumerate() {
        let done = stage.index() > s.index();
        let active = stage == *s;
        let style = if active {
            Style::default().fg(Color::Blue).add_modifier(Modifier::BOLD)
        } else if done {
            Style::default().fg(Color::Green)
        } else {
            Style::default().add_modifier(Modifier::DIM)
        };
        let mark = if done { "✓" } else { "" };
        spans.push(Span::styled(format!("{}{} {}", mark, i + 1, s.label()), style));
        if i + 1 < steps.len() {
            spans.push(Span::raw("  →  "));
        }
    }
    Line::from(spans)
}

/// One labelled input row: bold label, then the value line highlighted when
/// focused, with the placeholder shown dim while the value is empty.
fn push_input_field(
    lines: &mut Vec<Line<'static>>,
    label: &str,
    required: bool,
    value: &str,
    placeholder: &str,
    focused: bool,
) {
    let marker = if required { " *" } else { "" };
    lines.push(Line::from(Span::styled(
        format!("{}{}", label, marker),
        Style::default().add_modifier(Modifier::BOLD),
    )));
    let (text, mut style) = if value.is_empty() {
        (placeholder.to_string(), Style::default().add_modifier(Modifier::DIM))
    } else {
        (value.to_string(), Style::default())
    };
    if focused {
        style = style.fg(Color::Yellow).add_modifier(Modifier::BOLD);
    }
    lines.push(Line::from(Span::styled(format!("> {}", text), style)));
    lines.push(Line::from(Span::raw("")));
}

fn draw_wizard<B: Backend>(f: &mut Frame<B>, area: Rect, app: &AppState) {
    let w = &app.wizard;
    let d = &w.draft;

    let block = Block::default()
        .borders(Borders::ALL)
        .title(Span::styled(
            format!("NEW ENTRY — {}", w.stage.label()),
            Style::default().add_modifier(Modifier::BOLD),
        ))
        .border_style(Style::default().fg(Color::Green));

    let mut lines: Vec<Line> = Vec::new();

    if w.stage.index() >= 1 && w.stage.index() <= 6 {
        lines.push(progress_line(w.stage));
        lines.push(Line::from(Span::raw("")));
    }

    match w.stage {
        Stage::Intro => {
            lines.push(Line::from(Span::styled(
                "最速最小の一歩を。",
                Style::default().add_modifier(Modifier::BOLD),
            )));
            lines.push(Line::from(Span::raw("6ステップで今日の行動計画を作ります")));
            lines.push(Line::from(Span::raw("")));
            let outline = [
                ("①", "基本情報", "カテゴリ・タイトル"),
                ("②", "現状把握", "最優先タスク・進捗"),
                ("③", "障害と対策", "内的・外的ブロッカー"),
                ("④", "行動手順", "最大5つのアクション"),
                ("⑤", "SMART計画", "具体的な今日の計画"),
                ("⑥", "確認・修正", "内容確認後に保存"),
            ];
            for (n, label, desc) in outline {
                lines.push(Line::from(vec![
                    Span::styled(format!("{} {}", n, label), Style::default().add_modifier(Modifier::BOLD)),
                    Span::raw(format!("  {}", desc)),
                ]));
            }
            lines.push(Line::from(Span::raw("")));
            lines.push(Line::from(Span::styled(
                "(Enter で入力を開始 / Tab で履歴へ)",
                Style::default().add_modifier(Modifier::DIM),
            )));
        }
        Stage::BasicInfo => {
            push_input_field(&mut lines, "カテゴリ", true, &d.category, "例: 仕事、自己啓発、健康、趣味", w.field == 0);
            push_input_field(&mut lines, "今日取り組む内容", true, &d.title, "例: Webアプリのログイン機能を実装する", w.field == 1);
            lines.push(Line::from(Span::styled(
                format!("📅 日付（{}）は自動設定されます", d.date),
                Style::default().add_modifier(Modifier::DIM),
            )));
        }
        Stage::CurrentState => {
            push_input_field(&mut lines, "最優先タスク", true, &d.priority_task, "今日、最も前に進めたいことは何ですか？", w.field == 0);
            push_input_field(&mut lines, "現在の進み具合", false, &d.status, "例: 未着手、進捗中、最終調整", w.field == 1);
            push_input_field(&mut lines, "使える時間", false, &d.available_time, "例: 45分", w.field == 2);
        }
        Stage::ObstaclesAndActions => {
            lines.push(Line::from(Span::styled(
                "🧠 内的要因（心理・スキル）",
                Style::default().fg(Color::Blue),
            )));
            push_input_field(&mut lines, "障害", false, &d.obstacles.internal, "例: 不安感、やり方が分からない", w.field == 0);
            push_input_field(&mut lines, "対策", false, &d.actions.internal, "例: まず5分だけ手を動かしてみる", w.field == 1);
            lines.push(Line::from(Span::styled(
                "🌍 外的要因（環境・他者）",
                Style::default().fg(Color::Magenta),
            )));
            push_input_field(&mut lines, "障害", false, &d.obstacles.external, "例: 通知、呼びかけ", w.field == 2);
            push_input_field(&mut lines, "対策", false, &d.actions.external, "例: 通知をオフにする", w.field == 3);
        }
        Stage::MicroSteps => {
            lines.push(Line::from(Span::raw(
                "迷わず動けるよう、最初のアクションを細かく分解します（最大5つ）",
            )));
            lines.push(Line::from(Span::raw("")));
            for (i, s) in d.micro_steps.iter().enumerate() {
                let placeholder = if i == 0 {
                    "アクション 1（例: アプリを起動する）".to_string()
                } else {
                    format!("アクション {}", i + 1)
                };
                let (text, mut style) = if s.is_empty() {
                    (placeholder, Style::default().add_modifier(Modifier::DIM))
                } else {
                    (s.clone(), Style::default())
                };
                if w.field == i {
                    style = style.fg(Color::Yellow).add_modifier(Modifier::BOLD);
                }
                lines.push(Line::from(Span::styled(format!("{}. {}", i + 1, text), style)));
            }
            lines.push(Line::from(Span::raw("")));
            lines.push(Line::from(Span::styled(
                "(Ctrl+A ステップを追加 / Ctrl+D 選択中を削除 — 1番目は削除不可)",
                Style::default().add_modifier(Modifier::DIM),
            )));
        }
        Stage::SmartPlan => {
            lines.push(Line::from(Span::raw("具体的・測定可能・期限付きの計画にしましょう")));
            lines.push(Line::from(Span::raw("")));
            push_input_field(
                &mut lines,
                "SMARTな行動計画",
                true,
                &d.smart_plan,
                "例: 今日の21:00から書斎で、ログイン機能を1つ完成させる。完了の基準は動作確認まで。",
                w.field == 0,
            );
            lines.push(Line::from(Span::styled(
                "S：具体的 / M：測定可能 / A：達成可能 / R：関連性 / T：期限付き",
                Style::default().add_modifier(Modifier::DIM),
            )));
        }
        Stage::Review => {
            let unset = "（未入力）";
            lines.push(Line::from(vec![
                Span::styled("1 基本情報  ", Style::default().fg(Color::Blue).add_modifier(Modifier::BOLD)),
                Span::raw(format!(
                    "{} · {} · {}",
                    if d.title.is_empty() { unset } else { d.title.as_str() },
                    dash_if_empty(&d.category),
                    d.date
                )),
            ]));
            lines.push(Line::from(vec![
                Span::styled("2 最優先タスク  ", Style::default().fg(Color::Green).add_modifier(Modifier::BOLD)),
                Span::raw(format!(
                    "{} · {} · {}",
                    if d.priority_task.is_empty() { unset } else { d.priority_task.as_str() },
                    dash_if_empty(&d.status),
                    dash_if_empty(&d.available_time)
                )),
            ]));
            lines.push(Line::from(Span::styled(
                "3 障害と対策",
                Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
            )));
            lines.push(Line::from(Span::raw(format!(
                "  内: {} → {}",
                dash_if_empty(&d.obstacles.internal),
                dash_if_empty(&d.actions.internal)
            ))));
            lines.push(Line::from(Span::raw(format!(
                "  外: {} → {}",
                dash_if_empty(&d.obstacles.external),
                dash_if_empty(&d.actions.external)
            ))));
            lines.push(Line::from(Span::styled(
                "4 行動手順",
                Style::default().fg(Color::Magenta).add_modifier(Modifier::BOLD),
            )));
            let steps = nonempty_steps(&d.micro_steps);
            if steps.is_empty() {
                lines.push(Line::from(Span::raw(format!("  {}", unset))));
            } else {
                for (i, s) in steps.iter().enumerate() {
                    lines.push(Line::from(Span::raw(format!("  {}. {}", i + 1, s))));
                }
            }
            lines.push(Line::from(vec![
                Span::styled("5 SMART計画  ", Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
                Span::raw(if d.smart_plan.is_empty() { unset.to_string() } else { d.smart_plan.clone() }),
            ]));
            lines.push(Line::from(Span::raw("")));
            lines.push(Line::from(Span::styled(
                "(Enter この内容で記録を確定 / 1-5 で修正 / Esc 戻る)",
                Style::default().add_modifier(Modifier::DIM),
            )));
        }
        Stage::Done => {
            lines.push(Line::from(Span::styled(
                "✓ 記録完了！",
                Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
            )));
            lines.push(Line::from(Span::raw("さあ、最初の一歩を踏み出しましょう。")));
            lines.push(Line::from(Span::raw("行動後は「履歴」から振り返りを記入。AIがフィードバックします。")));
            lines.push(Line::from(Span::raw("")));
            lines.push(Line::from(Span::styled(
                "今日の行動計画",
                Style::default().add_modifier(Modifier::BOLD),
            )));
            lines.push(Line::from(Span::raw(dash_if_empty(&d.smart_plan).to_string())));
            lines.push(Line::from(Span::raw("")));
            lines.push(Line::from(Span::styled(
                "(Enter 履歴で振り返りを記録する)",
                Style::default().add_modifier(Modifier::DIM),
            )));
        }
    }

    if matches!(
        w.stage,
        Stage::BasicInfo | Stage::CurrentState | Stage::ObstaclesAndActions | Stage::MicroSteps | Stage::SmartPlan
    ) {
        lines.push(Line::from(Span::raw("")));
        lines.push(Line::from(Span::styled(
            "(Enter 次へ / Esc 戻る / ↑↓ 項目移動)",
            Style::default().add_modifier(Modifier::DIM),
        )));
    }

    f.render_widget(Paragraph::new(lines).block(block).wrap(Wrap { trim: false }), area);
}

/// Expanded detail for one entry, mirroring the review sections plus the
/// reflection block once completed.
fn detail_lines(entry: &Entry) -> Vec<Line<'static>> {
    let mut lines: Vec<Line> = Vec::new();
    lines.push(Line::from(Span::styled(
        "最優先タスク",
        Style::default().fg(Color::Blue).add_modifier(Modifier::BOLD),
    )));
    lines.push(Line::from(Span::raw(format!("  {}", dash_if_empty(&entry.priority_task)))));
    lines.push(Line::from(Span::raw(format!(
        "  {} · {}",
        dash_if_empty(&entry.status),
        dash_if_empty(&entry.available_time)
    ))));
    lines.push(Line::from(Span::styled(
        "障害と対策",
        Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
    )));
    lines.push(Line::from(Span::raw(format!(
        "  内: {} → {}",
        dash_if_empty(&entry.obstacles.internal),
        dash_if_empty(&entry.actions.internal)
    ))));
    lines.push(Line::from(Span::raw(format!(
        "  外: {} → {}",
        dash_if_empty(&entry.obstacles.external),
        dash_if_empty(&entry.actions.external)
    ))));
    lines.push(Line::from(Span::styled(
        "行動手順",
        Style::default().fg(Color::Magenta).add_modifier(Modifier::BOLD),
    )));
    let steps = nonempty_steps(&entry.micro_steps);
    if steps.is_empty() {
        lines.push(Line::from(Span::raw("  —")));
    } else {
        for (i, s) in steps.iter().enumerate() {
            lines.push(Line::from(Span::raw(format!("  {}. {}", i + 1, s))));
        }
    }
    lines.push(Line::from(Span::styled(
        "SMART計画",
        Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
    )));
    lines.push(Line::from(Span::raw(format!("  {}", dash_if_empty(&entry.smart_plan)))));

    if entry.reflection.completed {
        lines.push(Line::from(Span::styled(
            "振り返り",
            Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
        )));
        lines.push(Line::from(Span::raw(format!("  学び: {}", entry.reflection.learnings))));
        lines.push(Line::from(Span::raw(format!("  感想: {}", entry.reflection.feelings))));
        lines.push(Line::from(Span::raw(format!("  次へ: {}", entry.reflection.next_steps))));
        if let Some(fb) = &entry.reflection.ai_feedback {
            lines.push(Line::from(Span::styled(
                format!("  ✨ {}", fb),
                Style::default().fg(Color::Green),
            )));
        }
    } else {
        lines.push(Line::from(Span::styled(
            "未振り返り — r で振り返りを記入",
            Style::default().add_modifier(Modifier::DIM),
        )));
    }
    lines
}

fn draw_history<B: Backend>(f: &mut Frame<B>, area: Rect, app: &AppState) {
    let block = Block::default()
        .borders(Borders::ALL)
        .title(Span::styled("HISTORY — これまでの軌跡", Style::default().add_modifier(Modifier::BOLD)))
        .border_style(Style::default().fg(Color::Blue));

    let mut lines: Vec<Line> = Vec::new();

    // Reflection dialog replaces the list while open.
    if let Some(rid) = &app.reflection_id {
        let title = app
            .store
            .entries
            .iter()
            .find(|e| &e.id == rid)
            .map(|e| e.title.clone())
            .unwrap_or_default();
        lines.push(Line::from(Span::styled(
            format!("振り返り — {}", dash_if_empty(&title)),
            Style::default().add_modifier(Modifier::BOLD),
        )));
        lines.push(Line::from(Span::raw("")));
        let labels = ["今日の学び", "感じたこと", "次のステップ"];
        let placeholders = [
            "例: 思ったより集中できた",
            "例: 満足、少し疲れた",
            "例: 明日は範囲を広げる",
        ];
        for (i, label) in labels.iter().enumerate() {
            push_input_field(&mut lines, label, true, &app.refl_fields[i], placeholders[i], app.refl_field == i);
        }
        if let Some(n) = &app.notice {
            lines.push(Line::from(Span::styled(
                n.clone(),
                Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
            )));
            lines.push(Line::from(Span::raw("")));
        }
        lines.push(Line::from(Span::styled(
            "(Ctrl+S 提出 / Esc キャンセル / ↑↓ 項目移動)",
            Style::default().add_modifier(Modifier::DIM),
        )));
        f.render_widget(Paragraph::new(lines).block(block).wrap(Wrap { trim: false }), area);
        return;
    }

    if app.store.entries.is_empty() {
        lines.push(Line::from(Span::raw("まだ記録がありません。最初の一歩を記しましょう！")));
        lines.push(Line::from(Span::styled(
            "(Tab で新しい記録へ)",
            Style::default().add_modifier(Modifier::DIM),
        )));
        f.render_widget(Paragraph::new(lines).block(block).wrap(Wrap { trim: false }), area);
        return;
    }

    if let Some(n) = &app.notice {
        lines.push(Line::from(Span::styled(
            n.clone(),
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )));
        lines.push(Line::from(Span::raw("")));
    }

    for (i, entry) in app.store.entries.iter().enumerate() {
        let dot = if entry.reflection.completed { "✓" } else { "○" };
        let badge = if entry.reflection.completed { "振り返り済" } else { "未振り返り" };
        let mut style = Style::default();
        if i == app.cursor {
            style = style.fg(Color::Yellow).add_modifier(Modifier::BOLD);
        }
        lines.push(Line::from(Span::styled(
            format!(
                "{} {}  [{}]  {}  — {}",
                dot,
                entry.date,
                dash_if_empty(&entry.category),
                dash_if_empty(&entry.title),
                badge
            ),
            style,
        )));

        if app.delete_arm_id.as_deref() == Some(entry.id.as_str()) {
            lines.push(Line::from(Span::styled(
                "  この記録を削除しますか？ (y/n)",
                Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
            )));
        }

        if app.expanded_id.as_deref() == Some(entry.id.as_str()) {
            lines.extend(detail_lines(entry));
            lines.push(Line::from(Span::raw("")));
        }
    }

    lines.push(Line::from(Span::raw("")));
    lines.push(Line::from(Span::styled(
        "(↑↓ 選択 / Enter 詳細 / r 振り返り / d 削除 / Tab 新しい記録)",
        Style::default().add_modifier(Modifier::DIM),
    )));

    f.render_widget(Paragraph::new(lines).block(block).wrap(Wrap { trim: false }), area);
}

/// ---------------------------
///// === TESTS ===
/// ---------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct FixedChooser(usize);

    impl TemplateChooser for FixedChooser {
        fn choose(&mut self, len: usize) -> usize {
            self.0 % len
        }
    }

    fn store_in(dir: &TempDir) -> EntryStore {
        EntryStore::load(dir.path(), DATA_FILE_NAME).unwrap()
    }

    fn sample_entry(title: &str) -> Entry {
        Entry {
            title: title.to_string(),
            ..Entry::new_draft()
        }
    }

    fn completed_reflection(learnings: &str, feelings: &str, next_steps: &str) -> Reflection {
        Reflection {
            completed: true,
            learnings: learnings.to_string(),
            feelings: feelings.to_string(),
            next_steps: next_steps.to_string(),
            ai_feedback: Some("feedback".to_string()),
        }
    }

    #[test]
    fn add_then_reload_yields_entry_first() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        let older = sample_entry("older");
        let newer = sample_entry("newer");
        store.add(older.clone()).unwrap();
        store.add(newer.clone()).unwrap();

        let reloaded = store_in(&dir);
        assert_eq!(reloaded.entries.len(), 2);
        assert_eq!(reloaded.entries[0], newer);
        assert_eq!(reloaded.entries[1], older);
    }

    #[test]
    fn persisted_blob_matches_memory_after_every_mutation() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        let a = sample_entry("a");
        let b = sample_entry("b");
        store.add(a.clone()).unwrap();
        store.add(b.clone()).unwrap();
        store
            .update(&a.id, EntryPatch { reflection: Some(completed_reflection("l", "f", "n")), ..Default::default() })
            .unwrap();
        store.delete(&b.id).unwrap();

        let on_disk = fs::read_to_string(dir.path().join(DATA_FILE_NAME)).unwrap();
        let parsed: Vec<Entry> = serde_json::from_str(&on_disk).unwrap();
        assert_eq!(parsed, store.entries);
    }

    #[test]
    fn update_merges_reflection_and_touches_nothing_else() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        let mut a = sample_entry("a");
        a.category = "健康".to_string();
        a.smart_plan = "plan".to_string();
        let b = sample_entry("b");
        store.add(b.clone()).unwrap();
        store.add(a.clone()).unwrap();

        let refl = completed_reflection("学び", "感想", "次");
        store
            .update(&a.id, EntryPatch { reflection: Some(refl.clone()), ..Default::default() })
            .unwrap();

        let updated = &store.entries[0];
        assert_eq!(updated.reflection, refl);
        assert_eq!(updated.category, "健康");
        assert_eq!(updated.smart_plan, "plan");
        assert_eq!(updated.title, "a");
        // the other entry is untouched
        assert_eq!(store.entries[1], b);
    }

    #[test]
    fn update_and_delete_on_unknown_id_are_noops() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        let a = sample_entry("a");
        store.add(a.clone()).unwrap();

        store
            .update("no-such-id", EntryPatch { title: Some("x".to_string()), ..Default::default() })
            .unwrap();
        store.delete("no-such-id").unwrap();

        assert_eq!(store.entries.len(), 1);
        assert_eq!(store.entries[0], a);
    }

    #[test]
    fn delete_removes_exactly_one_and_preserves_order() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        let a = sample_entry("a");
        let b = sample_entry("b");
        let c = sample_entry("c");
        store.add(a.clone()).unwrap();
        store.add(b.clone()).unwrap();
        store.add(c.clone()).unwrap();

        store.delete(&b.id).unwrap();

        assert_eq!(store.entries.len(), 2);
        assert_eq!(store.entries[0].id, c.id);
        assert_eq!(store.entries[1].id, a.id);
    }

    #[test]
    fn malformed_data_file_loads_as_empty() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(DATA_FILE_NAME), "{not json at all").unwrap();
        let store = store_in(&dir);
        assert!(store.entries.is_empty());
    }

    #[test]
    fn micro_steps_are_bounded_at_five() {
        let mut w = WizardState::new();
        assert_eq!(w.draft.micro_steps.len(), 1);
        for _ in 0..10 {
            w.add_micro_step();
        }
        assert_eq!(w.draft.micro_steps.len(), MAX_MICRO_STEPS);
    }

    #[test]
    fn removing_first_micro_step_is_rejected() {
        let mut w = WizardState::new();
        w.update_micro_step(0, "靴を履く".to_string());
        w.remove_micro_step(0);
        assert_eq!(w.draft.micro_steps, vec!["靴を履く".to_string()]);
    }

    #[test]
    fn removing_a_micro_step_shifts_later_ones_down() {
        let mut w = WizardState::new();
        w.update_micro_step(0, "a".to_string());
        w.add_micro_step();
        w.update_micro_step(1, "b".to_string());
        w.add_micro_step();
        w.update_micro_step(2, "c".to_string());

        w.remove_micro_step(1);

        assert_eq!(w.draft.micro_steps, vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn wizard_prev_clamps_at_intro_and_next_stops_at_review() {
        let mut w = WizardState::new();
        w.prev();
        assert_eq!(w.stage, Stage::Intro);
        for _ in 0..20 {
            w.next();
        }
        assert_eq!(w.stage, Stage::Review);
    }

    #[test]
    fn jump_is_only_valid_from_review_and_only_into_input_stages() {
        let mut w = WizardState::new();
        w.next(); // BasicInfo
        w.jump_to(Stage::SmartPlan);
        assert_eq!(w.stage, Stage::BasicInfo);

        while w.stage != Stage::Review {
            w.next();
        }
        w.jump_to(Stage::Intro);
        assert_eq!(w.stage, Stage::Review);
        w.jump_to(Stage::MicroSteps);
        assert_eq!(w.stage, Stage::MicroSteps);
    }

    #[test]
    fn submit_is_a_noop_outside_review() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        let mut w = WizardState::new();
        w.next(); // BasicInfo
        w.submit(&mut store).unwrap();
        assert_eq!(w.stage, Stage::BasicInfo);
        assert!(store.entries.is_empty());
    }

    #[test]
    fn submit_from_review_records_the_draft_and_finishes() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        let mut w = WizardState::new();
        while w.stage != Stage::Review {
            w.next();
        }
        let draft_id = w.draft.id.clone();
        w.submit(&mut store).unwrap();
        assert_eq!(w.stage, Stage::Done);
        assert_eq!(store.entries.len(), 1);
        assert_eq!(store.entries[0].id, draft_id);
    }

    #[test]
    fn reflection_with_whitespace_only_field_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut app = AppState::new(store_in(&dir));
        app.store.add(sample_entry("a")).unwrap();

        app.open_reflection();
        app.refl_fields = ["学び".to_string(), "   ".to_string(), "次".to_string()];
        app.submit_reflection().unwrap();

        assert!(!app.store.entries[0].reflection.completed);
        assert!(app.notice.is_some());
        assert!(app.reflection_id.is_some()); // dialog stays open
    }

    #[test]
    fn feedback_interpolates_the_reflection_verbatim() {
        let input = ReflectionInput {
            learnings: "learned <b>rust</b>".to_string(),
            feelings: "happy".to_string(),
            next_steps: "keep going".to_string(),
        };
        let mut chooser = FixedChooser(0);
        let fb = generate_feedback(&mut chooser, &input);
        assert!(fb.contains("learned <b>rust</b>"));
        assert!(fb.contains("happy"));
        assert!(fb.contains("keep going"));
    }

    #[test]
    fn every_template_contains_the_next_steps_text() {
        let input = ReflectionInput {
            learnings: "l".to_string(),
            feelings: "f".to_string(),
            next_steps: "距離を伸ばす".to_string(),
        };
        for i in 0..4 {
            let mut chooser = FixedChooser(i);
            assert!(generate_feedback(&mut chooser, &input).contains("距離を伸ばす"));
        }
    }

    #[test]
    fn create_and_reflect_end_to_end() {
        let dir = TempDir::new().unwrap();
        let mut app = AppState::new(store_in(&dir));
        app.chooser = Box::new(FixedChooser(1));

        let mut w = WizardState::new();
        w.draft.category = "健康".to_string();
        w.draft.title = "30分歩く".to_string();
        w.update_micro_step(0, "靴を履く".to_string());
        w.add_micro_step();
        w.update_micro_step(1, "外に出る".to_string());
        w.draft.smart_plan = "19:00に近所を一周する".to_string();
        let id = w.draft.id.clone();
        while w.stage != Stage::Review {
            w.next();
        }
        w.submit(&mut app.store).unwrap();

        assert_eq!(app.store.entries.len(), 1);
        assert!(app.store.entries.iter().any(|e| e.id == id));

        app.cursor = 0;
        app.open_reflection();
        app.refl_fields = [
            "思ったより楽だった".to_string(),
            "満足".to_string(),
            "距離を伸ばす".to_string(),
        ];
        app.submit_reflection().unwrap();

        let entry = &app.store.entries[0];
        assert!(entry.reflection.completed);
        let fb = entry.reflection.ai_feedback.as_deref().unwrap();
        assert!(!fb.is_empty());
        assert!(fb.contains("距離を伸ばす"));
        assert!(app.reflection_id.is_none()); // dialog closed
    }

    #[test]
    fn arming_then_cancelling_delete_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let mut app = AppState::new(store_in(&dir));
        app.store.add(sample_entry("x")).unwrap();
        let before = app.store.entries.clone();

        app.arm_delete();
        assert!(app.delete_arm_id.is_some());
        app.cancel_delete();

        assert!(app.delete_arm_id.is_none());
        assert_eq!(app.store.entries, before);
    }

    #[test]
    fn arming_then_confirming_delete_removes_exactly_the_target() {
        let dir = TempDir::new().unwrap();
        let mut app = AppState::new(store_in(&dir));
        let a = sample_entry("a");
        let x = sample_entry("x");
        app.store.add(a.clone()).unwrap();
        app.store.add(x.clone()).unwrap();

        app.cursor = 0; // x is newest, at the top
        app.toggle_expand();
        app.arm_delete();
        app.confirm_delete().unwrap();

        assert_eq!(app.store.entries.len(), 1);
        assert_eq!(app.store.entries[0].id, a.id);
        assert!(app.expanded_id.is_none()); // expansion pointed at the victim
    }

    #[test]
    fn expanding_the_same_entry_twice_collapses_it() {
        let dir = TempDir::new().unwrap();
        let mut app = AppState::new(store_in(&dir));
        app.store.add(sample_entry("a")).unwrap();

        app.toggle_expand();
        assert!(app.expanded_id.is_some());
        app.toggle_expand();
        assert!(app.expanded_id.is_none());
    }

    #[test]
    fn reopening_reflection_on_completed_entry_is_refused() {
        let dir = TempDir::new().unwrap();
        let mut app = AppState::new(store_in(&dir));
        let mut e = sample_entry("a");
        e.reflection = completed_reflection("l", "f", "n");
        app.store.add(e).unwrap();

        app.open_reflection();

        assert!(app.reflection_id.is_none());
        assert!(app.notice.is_some());
    }
}
