use std::fmt::Write as _;
use std::io::{self, Read, Write as _};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use crossterm::cursor::MoveTo;
use crossterm::execute;
use crossterm::terminal::{Clear, ClearType};
use regex::Regex;
use strum::IntoEnumIterator;
use once_cell::sync::Lazy;
use time::format_description::{self, FormatItem};
use time::{Date, OffsetDateTime};

use crate::app::{
    CategoryFilter, MutationError, MutationGateway, NoteFeed, StatusFilter, ViewState,
};
use crate::auth::{AuthProvider, LocalAuth};
use crate::config::{AppConfig, SortDirection};
use crate::highlight::{build_highlight_regex, highlight};
use crate::model::{NoteColor, NoteDraft, NoteId, NoteRecord};
use crate::remote::RemoteStore;
use crate::storage::{format_date, parse_date, StorageHandle};

const PREVIEW_CHARS: usize = 50;
const WATCH_IDLE: Duration = Duration::from_secs(30);
const NOT_SIGNED_IN: &str = "Not signed in. Run `notes-sync login` first.\n";

static CREATED_FORMAT: Lazy<Vec<FormatItem<'static>>> = Lazy::new(|| {
    format_description::parse("[year]-[month]-[day] [hour]:[minute]")
        .expect("valid timestamp format description")
});

#[derive(Args, Debug, Clone)]
pub struct CredentialArgs {
    /// Account email address
    pub email: String,
    /// Password (prompted if omitted)
    #[arg(long)]
    pub password: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct AddArgs {
    /// Title for the note (prompted if omitted)
    #[arg()]
    pub title: Option<String>,
    /// Provide the note body inline. If omitted, reads from stdin.
    #[arg(long)]
    pub body: Option<String>,
    /// Category label
    #[arg(long)]
    pub category: Option<String>,
    /// Palette color name (see `colors`)
    #[arg(long)]
    pub color: Option<NoteColor>,
    /// Deadline as YYYY-MM-DD
    #[arg(long, value_parser = parse_deadline)]
    pub deadline: Option<Date>,
}

#[derive(Args, Debug, Clone)]
pub struct EditArgs {
    /// Note identifier
    pub id: String,
    #[arg(long)]
    pub title: Option<String>,
    #[arg(long)]
    pub body: Option<String>,
    /// New category; an empty string makes the note uncategorized
    #[arg(long)]
    pub category: Option<String>,
    #[arg(long)]
    pub color: Option<NoteColor>,
    /// Deadline as YYYY-MM-DD
    #[arg(long, value_parser = parse_deadline)]
    pub deadline: Option<Date>,
    /// Remove the deadline
    #[arg(long, conflicts_with = "deadline")]
    pub no_deadline: bool,
}

#[derive(Args, Debug, Clone)]
pub struct IdArgs {
    /// Note identifier
    pub id: String,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ViewArgs {
    /// Only notes whose title or content contains this text (case-insensitive)
    #[arg(long)]
    pub search: Option<String>,
    /// Only notes in this category (`all` for every note)
    #[arg(long)]
    pub category: Option<String>,
    /// all, pending or completed
    #[arg(long)]
    pub status: Option<StatusFilter>,
    /// ascending or descending by creation time
    #[arg(long)]
    pub sort: Option<SortDirection>,
}

#[derive(Args, Debug, Clone)]
pub struct ListArgs {
    #[command(flatten)]
    pub view: ViewArgs,
    /// Print the notes as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct WatchArgs {
    #[command(flatten)]
    pub view: ViewArgs,
    /// Exit after printing this many lists
    #[arg(long)]
    pub count: Option<usize>,
}

/// Everything a command needs once configuration and storage are up.
pub struct CliContext {
    pub config: Arc<AppConfig>,
    pub storage: StorageHandle,
    pub auth: Arc<LocalAuth>,
}

impl CliContext {
    fn store(&self) -> Arc<dyn RemoteStore> {
        Arc::new(self.storage.clone())
    }

    fn gateway(&self) -> MutationGateway {
        MutationGateway::new(self.store(), self.auth.clone())
    }

    fn open_feed(&self, args: &ViewArgs) -> Result<Option<NoteFeed>> {
        if self.auth.current_user_id().is_none() {
            return Ok(None);
        }
        let mut feed = NoteFeed::new(
            self.store(),
            self.auth.clone(),
            ViewState::from_config(&self.config),
        );
        if feed.is_live() && !feed.wait_for_change(self.config.sync.first_snapshot_timeout()) {
            tracing::warn!("no snapshot arrived in time; showing an empty list");
        }
        apply_view_args(&mut feed, args)?;
        Ok(Some(feed))
    }
}

pub fn signup(ctx: &CliContext, args: CredentialArgs) -> Result<()> {
    let password = match args.password {
        Some(password) => password,
        None => prompt("Password")?,
    };
    let user = ctx.auth.sign_up(&args.email, &password)?;
    println!(
        "Created account {user} for {}. Run `notes-sync login` to sign in.",
        args.email.trim()
    );
    Ok(())
}

pub fn login(ctx: &CliContext, args: CredentialArgs) -> Result<()> {
    let password = match args.password {
        Some(password) => password,
        None => prompt("Password")?,
    };
    let account = ctx.auth.sign_in(&args.email, &password)?;
    println!("Signed in as {}", account.email);
    Ok(())
}

pub fn logout(ctx: &CliContext) -> Result<()> {
    if ctx.auth.current_account().is_none() {
        println!("Not signed in.");
        return Ok(());
    }
    ctx.auth.sign_out()?;
    println!("Signed out.");
    Ok(())
}

pub fn whoami(ctx: &CliContext) -> Result<()> {
    match ctx.auth.current_account() {
        Some(account) => println!("{} ({})", account.email, account.user_id),
        None => print!("{NOT_SIGNED_IN}"),
    }
    Ok(())
}

pub fn add_note(ctx: &CliContext, args: AddArgs) -> Result<()> {
    let title = match args.title {
        Some(title) => title,
        None => prompt("Title")?,
    };
    let content = match args.body {
        Some(body) => body,
        None => match read_stdin()? {
            Some(body) => body,
            None => prompt("Content")?,
        },
    };
    let draft = NoteDraft::new(title, content)
        .with_category(args.category.unwrap_or_default())
        .with_color(args.color.unwrap_or(ctx.config.default_color))
        .with_deadline(args.deadline);
    let id = report_write("create", ctx.gateway().create(draft))?;
    println!("Created note {id}; it will show up in the list with the next update.");
    Ok(())
}

pub fn edit_note(ctx: &CliContext, args: EditArgs) -> Result<()> {
    let id = NoteId::new(args.id.trim());
    let Some(owner) = ctx.auth.current_user_id() else {
        return report_write("update", Err(MutationError::AuthRequired));
    };
    let current = ctx
        .storage
        .fetch_owned_note(&owner, &id)?
        .with_context(|| format!("note {id} not found"))?;
    let draft = merge_edit(&current, &args);
    report_write("update", ctx.gateway().update(&id, draft))?;
    println!("Updated note {id}; the list reflects it with the next update.");
    Ok(())
}

pub fn complete_note(ctx: &CliContext, args: IdArgs) -> Result<()> {
    let id = NoteId::new(args.id.trim());
    report_write("complete", ctx.gateway().mark_completed(&id))?;
    println!("Marked note {id} as completed.");
    Ok(())
}

pub fn remove_note(ctx: &CliContext, args: IdArgs) -> Result<()> {
    let id = NoteId::new(args.id.trim());
    report_write("delete", ctx.gateway().delete(&id))?;
    println!("Deleted note {id}; it disappears from the list with the next update.");
    Ok(())
}

pub fn list_notes(ctx: &CliContext, args: ListArgs) -> Result<()> {
    let styled = !args.json && atty::is(atty::Stream::Stdout);
    let output = run_list(ctx, &args, styled)?;
    print!("{output}");
    Ok(())
}

pub fn watch_notes(ctx: &CliContext, args: WatchArgs) -> Result<()> {
    let Some(mut feed) = ctx.open_feed(&args.view)? else {
        print!("{NOT_SIGNED_IN}");
        return Ok(());
    };
    let styled = atty::is(atty::Stream::Stdout);
    let mut stdout = io::stdout();
    let mut printed = 0usize;
    loop {
        if styled {
            execute!(stdout, Clear(ClearType::All), MoveTo(0, 0)).context("clearing terminal")?;
        } else if printed > 0 {
            writeln!(stdout, "---")?;
        }
        write!(stdout, "{}", render_view(&feed, styled))?;
        stdout.flush()?;
        printed += 1;
        if args.count.is_some_and(|limit| printed >= limit) {
            return Ok(());
        }
        while !feed.wait_for_change(WATCH_IDLE) {}
    }
}

pub fn print_colors() -> Result<()> {
    print!("{}", render_palette(NoteColor::default()));
    Ok(())
}

fn run_list(ctx: &CliContext, args: &ListArgs, styled: bool) -> Result<String> {
    let Some(feed) = ctx.open_feed(&args.view)? else {
        return Ok(NOT_SIGNED_IN.to_string());
    };
    if args.json {
        let mut json =
            serde_json::to_string_pretty(&feed.view().notes).context("serializing notes")?;
        json.push('\n');
        return Ok(json);
    }
    Ok(render_view(&feed, styled))
}

fn apply_view_args(feed: &mut NoteFeed, args: &ViewArgs) -> Result<()> {
    if let Some(search) = &args.search {
        feed.set_search_text(search.clone());
    }
    if let Some(status) = args.status {
        feed.set_status_filter(status);
    }
    if let Some(sort) = args.sort {
        feed.set_sort_direction(sort);
    }
    if let Some(raw) = &args.category {
        feed.select_category(parse_category(raw))
            .context("applying category filter")?;
    }
    Ok(())
}

fn report_write<T>(action: &str, result: Result<T, MutationError>) -> Result<T> {
    result.map_err(|err| {
        if let MutationError::RemoteWrite(_) = &err {
            tracing::error!(action, %err, "write failed");
        }
        anyhow::Error::new(err).context(format!("{action} failed"))
    })
}

fn merge_edit(current: &NoteRecord, args: &EditArgs) -> NoteDraft {
    let mut draft = current.to_draft();
    if let Some(title) = &args.title {
        draft.title = title.clone();
    }
    if let Some(body) = &args.body {
        draft.content = body.clone();
    }
    if let Some(category) = &args.category {
        draft.category = category.clone();
    }
    if let Some(color) = args.color {
        draft.color = color;
    }
    if args.no_deadline {
        draft.deadline = None;
    } else if let Some(deadline) = args.deadline {
        draft.deadline = Some(deadline);
    }
    draft
}

fn parse_category(raw: &str) -> CategoryFilter {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("all") {
        CategoryFilter::All
    } else {
        CategoryFilter::named(trimmed)
    }
}

fn parse_deadline(raw: &str) -> Result<Date, String> {
    parse_date(raw.trim())
        .map_err(|err| format!("expected YYYY-MM-DD: {err}"))
}

fn render_view(feed: &NoteFeed, styled: bool) -> String {
    let regex = if styled {
        build_highlight_regex(feed.view_state().search_text())
    } else {
        None
    };
    let view = feed.view();
    let mut out = render_notes(&view.notes, regex.as_ref());
    out.push_str(&render_categories(&view.categories));
    out
}

fn render_notes(notes: &[NoteRecord], regex: Option<&Regex>) -> String {
    if notes.is_empty() {
        return "No notes to show.\n".to_string();
    }
    let mut out = String::new();
    for note in notes {
        let mark = if note.completed { "[x]" } else { "[ ]" };
        let _ = writeln!(&mut out, "{mark} {}  {}", note.id, paint(&note.title, regex));
        let _ = writeln!(
            &mut out,
            "    category  {}",
            note.category().unwrap_or("uncategorized")
        );
        let _ = writeln!(&mut out, "    created   {}", format_created(note.created_at));
        if let Some(deadline) = note.deadline {
            let _ = writeln!(&mut out, "    deadline  {}", format_date(deadline));
        }
        let _ = writeln!(&mut out, "    color     {} ({})", note.color, note.color.hex());
        let _ = writeln!(&mut out, "    {}", paint(&preview(&note.content), regex));
        out.push('\n');
    }
    out
}

fn render_categories(categories: &[CategoryFilter]) -> String {
    let labels = categories
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!("categories: {labels}\n")
}

fn render_palette(default: NoteColor) -> String {
    let mut out = String::new();
    for color in NoteColor::iter() {
        let marker = if color == default { "  (default)" } else { "" };
        let _ = writeln!(&mut out, "{:<12}{}{marker}", color.to_string(), color.hex());
    }
    out
}

fn paint(text: &str, regex: Option<&Regex>) -> String {
    match regex {
        Some(regex) => highlight(text, regex),
        None => text.to_owned(),
    }
}

fn preview(content: &str) -> String {
    let flat = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= PREVIEW_CHARS {
        return flat;
    }
    let mut cut: String = flat.chars().take(PREVIEW_CHARS).collect();
    cut.push_str("...");
    cut
}

fn format_created(created_at: Option<OffsetDateTime>) -> String {
    match created_at {
        Some(at) => at
            .format(CREATED_FORMAT.as_slice())
            .unwrap_or_else(|_| at.unix_timestamp().to_string()),
        None => "pending".to_string(),
    }
}

fn prompt(label: &str) -> Result<String> {
    let mut stdout = io::stdout();
    write!(stdout, "{}: ", label)?;
    stdout.flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim_end().to_owned())
}

fn read_stdin() -> Result<Option<String>> {
    if atty::is(atty::Stream::Stdin) {
        return Ok(None);
    }
    let mut buf = String::new();
    io::stdin().read_to_string(&mut buf)?;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UserId;
    use crate::storage::tests::init_storage;
    use tempfile::TempDir;
    use time::macros::{date, datetime};

    type TestResult<T = ()> = Result<T>;

    fn record(id: &str, title: &str, content: &str) -> NoteRecord {
        NoteRecord {
            id: NoteId::new(id),
            owner_id: UserId::new("owner"),
            title: title.into(),
            content: content.into(),
            category: String::new(),
            color: NoteColor::White,
            deadline: None,
            completed: false,
            created_at: None,
        }
    }

    fn signed_in_context() -> TestResult<(TempDir, CliContext)> {
        let (temp, storage) = init_storage()?;
        let auth = LocalAuth::open(storage.clone(), temp.path().join("state/session.json"))?;
        auth.sign_up("ada@example.com", "lovelace")?;
        auth.sign_in("ada@example.com", "lovelace")?;
        let ctx = CliContext {
            config: Arc::new(AppConfig::default()),
            storage,
            auth: Arc::new(auth),
        };
        Ok((temp, ctx))
    }

    fn list_args(view: ViewArgs) -> ListArgs {
        ListArgs { view, json: false }
    }

    #[test]
    fn renders_each_note_with_its_details() {
        let mut report = record(
            "n2",
            "Quarterly report",
            "Draft the numbers for the board meeting and send them to finance by Friday.",
        );
        report.category = "Work".into();
        report.color = NoteColor::Sky;
        report.deadline = Some(date!(2026 - 06 - 30));
        report.created_at = Some(datetime!(2026-05-01 9:30 UTC));
        let mut milk = record("n1", "Milk", "Two\nlitres");
        milk.completed = true;

        insta::assert_snapshot!(render_notes(&[report, milk], None), @r###"
        [ ] n2  Quarterly report
            category  Work
            created   2026-05-01 09:30
            deadline  2026-06-30
            color     sky (#9bf6ff)
            Draft the numbers for the board meeting and send t...

        [x] n1  Milk
            category  uncategorized
            created   pending
            color     white (#fff)
            Two litres
        "###);
    }

    #[test]
    fn empty_list_says_so() {
        assert_eq!(render_notes(&[], None), "No notes to show.\n");
        assert_eq!(
            render_categories(&[CategoryFilter::All, CategoryFilter::named("Work")]),
            "categories: all, Work\n"
        );
    }

    #[test]
    fn preview_counts_characters_not_bytes() {
        let exact = "é".repeat(PREVIEW_CHARS);
        assert_eq!(preview(&exact), exact);
        let longer = "é".repeat(PREVIEW_CHARS + 1);
        assert_eq!(preview(&longer), format!("{exact}..."));
    }

    #[test]
    fn palette_marks_default() {
        insta::assert_snapshot!(render_palette(NoteColor::White), @r###"
        white       #fff  (default)
        rose        #ffadad
        peach       #ffd6a5
        lemon       #fdffb6
        mint        #caffbf
        sky         #9bf6ff
        periwinkle  #a0c4ff
        lavender    #bdb2ff
        orchid      #ffc6ff
        "###);
    }

    #[test]
    fn edit_keeps_unspecified_fields() {
        let mut current = record("n1", "Title", "Body");
        current.category = "Work".into();
        current.color = NoteColor::Mint;
        current.deadline = Some(date!(2026 - 01 - 02));
        let args = EditArgs {
            id: "n1".into(),
            title: Some("Renamed".into()),
            body: None,
            category: None,
            color: None,
            deadline: None,
            no_deadline: true,
        };
        let draft = merge_edit(&current, &args);
        assert_eq!(draft.title, "Renamed");
        assert_eq!(draft.content, "Body");
        assert_eq!(draft.category, "Work");
        assert_eq!(draft.color, NoteColor::Mint);
        assert_eq!(draft.deadline, None);
    }

    fn rename(id: &NoteId) -> EditArgs {
        EditArgs {
            id: id.to_string(),
            title: Some("Renamed".into()),
            body: None,
            category: None,
            color: None,
            deadline: None,
            no_deadline: false,
        }
    }

    #[test]
    fn edit_only_reaches_own_notes() -> TestResult {
        let (_temp, ctx) = signed_in_context()?;
        let foreign = ctx
            .storage
            .insert(&UserId::new("someone-else"), &NoteDraft::new("Theirs", "c"))?;
        let err = edit_note(&ctx, rename(&foreign)).unwrap_err();
        assert!(err.to_string().contains("not found"));
        let stored = ctx.storage.fetch_note(&foreign)?.expect("note stored");
        assert_eq!(stored.title, "Theirs");

        let mine = ctx.gateway().create(NoteDraft::new("Mine", "c"))?;
        edit_note(&ctx, rename(&mine))?;
        let stored = ctx.storage.fetch_note(&mine)?.expect("note stored");
        assert_eq!(stored.title, "Renamed");
        Ok(())
    }

    #[test]
    fn edit_when_signed_out_reports_missing_session() -> TestResult {
        let (_temp, ctx) = signed_in_context()?;
        let id = ctx.gateway().create(NoteDraft::new("Mine", "c"))?;
        ctx.auth.sign_out()?;

        let err = edit_note(&ctx, rename(&id)).unwrap_err();
        assert_matches::assert_matches!(
            err.downcast_ref::<MutationError>(),
            Some(MutationError::AuthRequired)
        );
        Ok(())
    }

    #[test]
    fn parses_filters_and_dates() {
        assert_eq!(parse_category(" ALL "), CategoryFilter::All);
        assert_eq!(parse_category("Work "), CategoryFilter::named("Work"));
        assert_eq!(parse_deadline("2026-03-09"), Ok(date!(2026 - 03 - 09)));
        assert!(parse_deadline("09/03/2026").is_err());
    }

    #[test]
    fn shown_deadline_is_accepted_back_as_input() {
        let shown = format_date(date!(2026 - 03 - 09));
        assert_eq!(shown, "2026-03-09");
        assert_eq!(parse_deadline(&shown), Ok(date!(2026 - 03 - 09)));
    }

    #[test]
    fn list_requires_session() -> TestResult {
        let (temp, storage) = init_storage()?;
        let auth = LocalAuth::open(storage.clone(), temp.path().join("session.json"))?;
        let ctx = CliContext {
            config: Arc::new(AppConfig::default()),
            storage,
            auth: Arc::new(auth),
        };
        let output = run_list(&ctx, &list_args(ViewArgs::default()), false)?;
        assert_eq!(output, NOT_SIGNED_IN);
        Ok(())
    }

    #[test]
    fn list_applies_view_arguments() -> TestResult {
        let (_temp, ctx) = signed_in_context()?;
        let gateway = ctx.gateway();
        gateway.create(NoteDraft::new("Groceries", "milk and eggs").with_category("Home"))?;
        let report = gateway.create(NoteDraft::new("Report", "numbers").with_category("Work"))?;
        gateway.mark_completed(&report)?;

        let output = run_list(
            &ctx,
            &list_args(ViewArgs {
                status: Some(StatusFilter::Pending),
                ..ViewArgs::default()
            }),
            false,
        )?;
        assert!(output.contains("Groceries"));
        assert!(!output.contains("Report"));
        assert!(output.ends_with("categories: all, Work, Home\n"));

        let output = run_list(
            &ctx,
            &list_args(ViewArgs {
                search: Some("NUMBERS".into()),
                ..ViewArgs::default()
            }),
            false,
        )?;
        assert!(output.contains("[x]"));
        assert!(output.contains("Report"));
        assert!(!output.contains("Groceries"));

        let unknown = run_list(
            &ctx,
            &list_args(ViewArgs {
                category: Some("Garden".into()),
                ..ViewArgs::default()
            }),
            false,
        );
        assert!(unknown.is_err());
        Ok(())
    }

    #[test]
    fn list_can_emit_json() -> TestResult {
        let (_temp, ctx) = signed_in_context()?;
        ctx.gateway().create(
            NoteDraft::new("Dentist", "call to reschedule")
                .with_color(NoteColor::Rose)
                .with_deadline(Some(date!(2026 - 11 - 20))),
        )?;

        let args = ListArgs {
            view: ViewArgs::default(),
            json: true,
        };
        let output = run_list(&ctx, &args, false)?;
        let parsed: serde_json::Value = serde_json::from_str(&output)?;
        let notes = parsed.as_array().context("array of notes")?;
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0]["title"], "Dentist");
        assert_eq!(notes[0]["color"], "rose");
        assert_eq!(notes[0]["deadline"], "2026-11-20");
        assert_eq!(notes[0]["completed"], false);
        Ok(())
    }
}
