use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::OnceLock;

use regex::Regex;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

use crate::model::{RuntimePermission, StepOutput};
use crate::{Error, Result};

/// Installed-package queries and installation.
pub trait PackageManager: Send + Sync {
    /// Directory holding the installed APKs, or `None` when the package has none.
    fn installed_source_dir<'a>(
        &'a self,
        package_name: &'a str,
        user_id: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Option<PathBuf>>> + Send + 'a>>;

    fn uid<'a>(
        &'a self,
        package_name: &'a str,
        user_id: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Option<u32>>> + Send + 'a>>;

    fn query_installed<'a>(
        &'a self,
        package_name: &'a str,
        user_id: u32,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;

    fn install<'a>(
        &'a self,
        user_id: u32,
        apk: &'a Path,
    ) -> Pin<Box<dyn Future<Output = StepOutput> + Send + 'a>>;

    /// Opens a multi-part install session; returns its id.
    fn create_session<'a>(
        &'a self,
        user_id: u32,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

    fn write_session<'a>(
        &'a self,
        session_id: &'a str,
        apk: &'a Path,
    ) -> Pin<Box<dyn Future<Output = StepOutput> + Send + 'a>>;

    fn commit_session<'a>(
        &'a self,
        session_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = StepOutput> + Send + 'a>>;

    /// Stops every process of the package so its data is quiescent.
    fn force_stop<'a>(
        &'a self,
        package_name: &'a str,
        user_id: u32,
    ) -> Pin<Box<dyn Future<Output = StepOutput> + Send + 'a>>;

    fn runtime_permissions<'a>(
        &'a self,
        package_name: &'a str,
        user_id: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RuntimePermission>>> + Send + 'a>>;

    /// Grants or revokes one runtime permission.
    fn set_permission<'a>(
        &'a self,
        package_name: &'a str,
        user_id: u32,
        permission: &'a RuntimePermission,
    ) -> Pin<Box<dyn Future<Output = StepOutput> + Send + 'a>>;

    /// Settings.Secure.ANDROID_ID assigned to the package, if any.
    fn ssaid<'a>(
        &'a self,
        package_name: &'a str,
        user_id: u32,
        uid: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>>;

    fn set_ssaid<'a>(
        &'a self,
        package_name: &'a str,
        user_id: u32,
        uid: u32,
        ssaid: &'a str,
    ) -> Pin<Box<dyn Future<Output = StepOutput> + Send + 'a>>;
}

/// Drives the platform `pm`, `am` and `dumpsys` tools. SSAIDs are read from and
/// written to the per-user `settings_ssaid.xml`, converting binary XML through
/// `abx2xml` / `xml2abx` when needed.
#[derive(Debug, Clone)]
pub struct ShellPackageManager {
    program: PathBuf,
    activity_manager: PathBuf,
    dumpsys: PathBuf,
    users_dir: PathBuf,
}

impl Default for ShellPackageManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellPackageManager {
    pub fn new() -> Self {
        Self::with_program("pm")
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            activity_manager: PathBuf::from("am"),
            dumpsys: PathBuf::from("dumpsys"),
            users_dir: PathBuf::from("/data/system/users"),
        }
    }

    /// Directory holding `{user_id}/settings_ssaid.xml`.
    pub fn with_users_dir(mut self, users_dir: impl Into<PathBuf>) -> Self {
        self.users_dir = users_dir.into();
        self
    }

    fn ssaid_path(&self, user_id: u32) -> PathBuf {
        self.users_dir
            .join(user_id.to_string())
            .join("settings_ssaid.xml")
    }

    async fn run(&self, args: &[String]) -> StepOutput {
        self.exec(&self.program, args).await
    }

    async fn exec(&self, program: &Path, args: &[String]) -> StepOutput {
        debug!(
            event = "pm.exec",
            program = %program.display(),
            args = %args.join(" "),
            "pm.exec"
        );
        let output = match Command::new(program).args(args).output().await {
            Ok(output) => output,
            Err(e) => {
                return StepOutput::line(false, format!("Failed to run {}: {e}", program.display()));
            }
        };
        let mut lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect();
        lines.extend(
            String::from_utf8_lossy(&output.stderr)
                .lines()
                .map(str::to_string),
        );
        lines.retain(|l| !l.trim().is_empty());
        StepOutput {
            success: output.status.success(),
            lines,
        }
    }

    async fn query(&self, args: &[String]) -> Result<Vec<String>> {
        self.query_with(&self.program, args).await
    }

    async fn query_with(&self, program: &Path, args: &[String]) -> Result<Vec<String>> {
        let out = self.exec(program, args).await;
        if !out.success {
            return Err(Error::PackageManager {
                message: format!(
                    "{} {} failed: {}",
                    program.display(),
                    args.join(" "),
                    out.lines.join("; ")
                ),
            });
        }
        Ok(out.lines)
    }

    /// Text form of the SSAID table and whether the file on disk is binary XML.
    async fn read_ssaid_table(&self, user_id: u32) -> Result<(String, bool)> {
        let path = self.ssaid_path(user_id);
        let bytes = tokio::fs::read(&path).await?;
        if bytes.trim_ascii_start().starts_with(b"<") {
            return Ok((String::from_utf8_lossy(&bytes).into_owned(), false));
        }
        let lines = self
            .query_with(
                Path::new("abx2xml"),
                &[path_arg(&path)?, "-".to_string()],
            )
            .await?;
        Ok((lines.join("\n"), true))
    }

    async fn write_ssaid_table(&self, user_id: u32, xml: &str, binary: bool) -> Result<()> {
        let path = self.ssaid_path(user_id);
        if !binary {
            let tmp = path.with_extension("xml.tmp");
            tokio::fs::write(&tmp, xml).await?;
            tokio::fs::rename(&tmp, &path).await?;
            return Ok(());
        }
        let tmp = path.with_extension("appvault.xml");
        tokio::fs::write(&tmp, xml).await?;
        let converted = self
            .query_with(Path::new("xml2abx"), &[path_arg(&tmp)?, path_arg(&path)?])
            .await;
        let _ = tokio::fs::remove_file(&tmp).await;
        converted.map(|_| ())
    }
}

fn path_arg(path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| Error::NonUtf8Path {
            path: path.to_path_buf(),
        })
}

impl PackageManager for ShellPackageManager {
    fn installed_source_dir<'a>(
        &'a self,
        package_name: &'a str,
        user_id: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Option<PathBuf>>> + Send + 'a>> {
        Box::pin(async move {
            let args = [
                "path".to_string(),
                "--user".to_string(),
                user_id.to_string(),
                package_name.to_string(),
            ];
            let out = self.run(&args).await;
            if !out.success {
                return Ok(None);
            }
            Ok(parse_pm_path(&out.lines)
                .first()
                .and_then(|apk| apk.parent().map(Path::to_path_buf)))
        })
    }

    fn uid<'a>(
        &'a self,
        package_name: &'a str,
        user_id: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Option<u32>>> + Send + 'a>> {
        Box::pin(async move {
            let lines = self.query(&list_args(package_name, user_id)).await?;
            Ok(parse_listed_uid(&lines, package_name))
        })
    }

    fn query_installed<'a>(
        &'a self,
        package_name: &'a str,
        user_id: u32,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            let lines = self.query(&list_args(package_name, user_id)).await?;
            Ok(parse_listed_uid(&lines, package_name).is_some())
        })
    }

    fn install<'a>(
        &'a self,
        user_id: u32,
        apk: &'a Path,
    ) -> Pin<Box<dyn Future<Output = StepOutput> + Send + 'a>> {
        Box::pin(async move {
            let apk = match path_arg(apk) {
                Ok(p) => p,
                Err(e) => return StepOutput::line(false, e.to_string()),
            };
            let args = [
                "install".to_string(),
                "-r".to_string(),
                "-t".to_string(),
                "--user".to_string(),
                user_id.to_string(),
                apk,
            ];
            self.run(&args).await
        })
    }

    fn create_session<'a>(
        &'a self,
        user_id: u32,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let args = [
                "install-create".to_string(),
                "-r".to_string(),
                "-t".to_string(),
                "--user".to_string(),
                user_id.to_string(),
            ];
            let lines = self.query(&args).await?;
            parse_session_id(&lines).ok_or_else(|| Error::PackageManager {
                message: format!("no session id in: {}", lines.join("; ")),
            })
        })
    }

    fn write_session<'a>(
        &'a self,
        session_id: &'a str,
        apk: &'a Path,
    ) -> Pin<Box<dyn Future<Output = StepOutput> + Send + 'a>> {
        Box::pin(async move {
            let path = match path_arg(apk) {
                Ok(p) => p,
                Err(e) => return StepOutput::line(false, e.to_string()),
            };
            let name = apk
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "base.apk".to_string());
            let args = [
                "install-write".to_string(),
                session_id.to_string(),
                name,
                path,
            ];
            self.run(&args).await
        })
    }

    fn commit_session<'a>(
        &'a self,
        session_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = StepOutput> + Send + 'a>> {
        Box::pin(async move {
            let args = ["install-commit".to_string(), session_id.to_string()];
            self.run(&args).await
        })
    }

    fn force_stop<'a>(
        &'a self,
        package_name: &'a str,
        user_id: u32,
    ) -> Pin<Box<dyn Future<Output = StepOutput> + Send + 'a>> {
        Box::pin(async move {
            let args = [
                "force-stop".to_string(),
                "--user".to_string(),
                user_id.to_string(),
                package_name.to_string(),
            ];
            self.exec(&self.activity_manager, &args).await
        })
    }

    fn runtime_permissions<'a>(
        &'a self,
        package_name: &'a str,
        user_id: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RuntimePermission>>> + Send + 'a>> {
        Box::pin(async move {
            let args = ["package".to_string(), package_name.to_string()];
            let lines = self.query_with(&self.dumpsys, &args).await?;
            Ok(parse_runtime_permissions(&lines, user_id))
        })
    }

    fn set_permission<'a>(
        &'a self,
        package_name: &'a str,
        user_id: u32,
        permission: &'a RuntimePermission,
    ) -> Pin<Box<dyn Future<Output = StepOutput> + Send + 'a>> {
        Box::pin(async move {
            let verb = if permission.granted { "grant" } else { "revoke" };
            let args = [
                verb.to_string(),
                "--user".to_string(),
                user_id.to_string(),
                package_name.to_string(),
                permission.name.clone(),
            ];
            self.run(&args).await
        })
    }

    fn ssaid<'a>(
        &'a self,
        package_name: &'a str,
        user_id: u32,
        uid: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>> {
        Box::pin(async move {
            let (xml, _) = self.read_ssaid_table(user_id).await?;
            Ok(parse_ssaid(&xml, package_name, uid))
        })
    }

    fn set_ssaid<'a>(
        &'a self,
        package_name: &'a str,
        user_id: u32,
        uid: u32,
        ssaid: &'a str,
    ) -> Pin<Box<dyn Future<Output = StepOutput> + Send + 'a>> {
        Box::pin(async move {
            let (xml, binary) = match self.read_ssaid_table(user_id).await {
                Ok(table) => table,
                Err(e) => return StepOutput::line(false, format!("Failed to read ssaid table: {e}")),
            };
            let Some(updated) = replace_ssaid(&xml, package_name, uid, ssaid) else {
                return StepOutput::line(false, format!("No ssaid entry for {package_name}."));
            };
            match self.write_ssaid_table(user_id, &updated, binary).await {
                Ok(()) => StepOutput::line(true, "Ssaid takes effect after a reboot."),
                Err(e) => StepOutput::line(false, format!("Failed to write ssaid table: {e}")),
            }
        })
    }
}

fn list_args(package_name: &str, user_id: u32) -> [String; 6] {
    [
        "list".to_string(),
        "packages".to_string(),
        "-U".to_string(),
        "--user".to_string(),
        user_id.to_string(),
        package_name.to_string(),
    ]
}

/// `package:/data/app/~~x/com.app-1/base.apk` lines, in output order.
pub fn parse_pm_path(lines: &[String]) -> Vec<PathBuf> {
    lines
        .iter()
        .filter_map(|l| l.trim().strip_prefix("package:"))
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Uid of exactly `package_name` in `package:<name> uid:<uid>` lines. `pm list`
/// filters by substring, so other packages may be present.
pub fn parse_listed_uid(lines: &[String], package_name: &str) -> Option<u32> {
    lines.iter().find_map(|line| {
        let mut name = None;
        let mut uid = None;
        for token in line.split_whitespace() {
            if let Some(v) = token.strip_prefix("package:") {
                name = Some(v);
            } else if let Some(v) = token.strip_prefix("uid:") {
                uid = v.split(',').next().and_then(|u| u.parse::<u32>().ok());
            }
        }
        (name == Some(package_name)).then_some(uid).flatten()
    })
}

/// `Success: created install session [1234]`
pub fn parse_session_id(lines: &[String]) -> Option<String> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    let re = PATTERN
        .get_or_init(|| Regex::new(r"\[(\d+)\]"))
        .as_ref()
        .ok()?;
    lines
        .iter()
        .find_map(|l| re.captures(l).map(|c| c[1].to_string()))
}

/// Runtime permissions of `user_id` from `dumpsys package` output. Only the
/// `runtime permissions:` block under `User <id>:` counts.
pub fn parse_runtime_permissions(lines: &[String], user_id: u32) -> Vec<RuntimePermission> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    let Some(re) = PATTERN
        .get_or_init(|| Regex::new(r"^\s*([\w.]+): granted=(true|false)"))
        .as_ref()
        .ok()
    else {
        return Vec::new();
    };

    let user_header = format!("User {user_id}:");
    let mut in_user = false;
    let mut in_block = false;
    let mut permissions = Vec::new();
    for line in lines {
        let trimmed = line.trim_start();
        if trimmed.starts_with("User ") && trimmed.contains(':') {
            in_user = trimmed.starts_with(&user_header);
            in_block = false;
            continue;
        }
        if !in_user {
            continue;
        }
        if trimmed.starts_with("runtime permissions:") {
            in_block = true;
            continue;
        }
        if in_block {
            match re.captures(line) {
                Some(caps) => permissions.push(RuntimePermission {
                    name: caps[1].to_string(),
                    granted: &caps[2] == "true",
                }),
                None => in_block = false,
            }
        }
    }
    permissions
}

fn ssaid_patterns() -> Option<&'static (Regex, Regex)> {
    static PATTERNS: OnceLock<std::result::Result<(Regex, Regex), regex::Error>> =
        OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Ok((
                Regex::new(r"<setting\s[^>]*?/?>")?,
                Regex::new(r#"(\w+)="([^"]*)""#)?,
            ))
        })
        .as_ref()
        .ok()
}

/// Byte range of the `<setting>` element for `package_name` / `uid`, plus its value.
fn find_ssaid(xml: &str, package_name: &str, uid: u32) -> Option<(std::ops::Range<usize>, String)> {
    let (element, attribute) = ssaid_patterns()?;
    let uid = uid.to_string();
    element.find_iter(xml).find_map(|m| {
        let mut package = None;
        let mut name = None;
        let mut value = None;
        for caps in attribute.captures_iter(m.as_str()) {
            let v = caps.get(2).map(|v| v.as_str());
            match &caps[1] {
                "package" => package = v,
                "name" => name = v,
                "value" => value = v,
                _ => {}
            }
        }
        (package == Some(package_name) && name == Some(uid.as_str()))
            .then(|| (m.range(), value.unwrap_or_default().to_string()))
    })
}

/// SSAID of `package_name` running as `uid` in a `settings_ssaid.xml` table.
pub fn parse_ssaid(xml: &str, package_name: &str, uid: u32) -> Option<String> {
    find_ssaid(xml, package_name, uid)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

/// The table with the package's SSAID replaced. `None` when the package has no
/// entry or `ssaid` is not a hex string.
pub fn replace_ssaid(xml: &str, package_name: &str, uid: u32, ssaid: &str) -> Option<String> {
    if ssaid.is_empty() || !ssaid.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let (range, old) = find_ssaid(xml, package_name, uid)?;
    let element = &xml[range.clone()];
    let replaced = element.replacen(
        &format!(" value=\"{old}\""),
        &format!(" value=\"{ssaid}\""),
        1,
    );
    if replaced == element && old != ssaid {
        return None;
    }
    Some(format!("{}{replaced}{}", &xml[..range.start], &xml[range.end..]))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct InstalledPackage {
    uid: u32,
    source_dir: Option<PathBuf>,
    permissions: Vec<RuntimePermission>,
    ssaid: Option<String>,
}

impl InstalledPackage {
    fn new(uid: u32, source_dir: Option<PathBuf>) -> Self {
        Self {
            uid,
            source_dir,
            permissions: Vec::new(),
            ssaid: None,
        }
    }
}

#[derive(Debug, Default)]
struct InMemoryPmState {
    installed: HashMap<(String, u32), InstalledPackage>,
    on_install: Option<(String, u32, u32)>,
    install_succeeds: bool,
    sessions: HashMap<String, Vec<PathBuf>>,
    next_session: u32,
    installed_apks: Vec<PathBuf>,
    force_stopped: Vec<(String, u32)>,
}

/// Package database kept in memory. Installs succeed or fail as configured, and
/// a successful install registers the package set with [`Self::register_on_install`].
#[derive(Debug)]
pub struct InMemoryPackageManager {
    state: Mutex<InMemoryPmState>,
}

impl Default for InMemoryPackageManager {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPackageManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InMemoryPmState {
                install_succeeds: true,
                next_session: 1,
                ..InMemoryPmState::default()
            }),
        }
    }

    pub async fn add_package(
        &self,
        package_name: &str,
        user_id: u32,
        uid: u32,
        source_dir: Option<PathBuf>,
    ) {
        self.state.lock().await.installed.insert(
            (package_name.to_string(), user_id),
            InstalledPackage::new(uid, source_dir),
        );
    }

    pub async fn remove_package(&self, package_name: &str, user_id: u32) {
        self.state
            .lock()
            .await
            .installed
            .remove(&(package_name.to_string(), user_id));
    }

    pub async fn register_on_install(&self, package_name: &str, user_id: u32, uid: u32) {
        self.state.lock().await.on_install = Some((package_name.to_string(), user_id, uid));
    }

    pub async fn set_install_succeeds(&self, succeeds: bool) {
        self.state.lock().await.install_succeeds = succeeds;
    }

    /// Every APK passed to `install` or written to a committed session.
    pub async fn installed_apks(&self) -> Vec<PathBuf> {
        self.state.lock().await.installed_apks.clone()
    }

    pub async fn seed_permissions(
        &self,
        package_name: &str,
        user_id: u32,
        permissions: Vec<RuntimePermission>,
    ) {
        if let Some(p) = self
            .state
            .lock()
            .await
            .installed
            .get_mut(&(package_name.to_string(), user_id))
        {
            p.permissions = permissions;
        }
    }

    pub async fn seed_ssaid(&self, package_name: &str, user_id: u32, ssaid: &str) {
        if let Some(p) = self
            .state
            .lock()
            .await
            .installed
            .get_mut(&(package_name.to_string(), user_id))
        {
            p.ssaid = Some(ssaid.to_string());
        }
    }

    pub async fn permissions_of(&self, package_name: &str, user_id: u32) -> Vec<RuntimePermission> {
        self.state
            .lock()
            .await
            .installed
            .get(&(package_name.to_string(), user_id))
            .map(|p| p.permissions.clone())
            .unwrap_or_default()
    }

    pub async fn ssaid_of(&self, package_name: &str, user_id: u32) -> Option<String> {
        self.state
            .lock()
            .await
            .installed
            .get(&(package_name.to_string(), user_id))
            .and_then(|p| p.ssaid.clone())
    }

    /// Every `(package, user)` passed to `force_stop`, in call order.
    pub async fn force_stopped(&self) -> Vec<(String, u32)> {
        self.state.lock().await.force_stopped.clone()
    }

    fn finish_install(state: &mut InMemoryPmState, apks: Vec<PathBuf>) -> StepOutput {
        if !state.install_succeeds {
            return StepOutput::line(false, "Failure [INSTALL_FAILED_INTERNAL_ERROR]");
        }
        state.installed_apks.extend(apks);
        if let Some((name, user_id, uid)) = state.on_install.clone() {
            state
                .installed
                .insert((name, user_id), InstalledPackage::new(uid, None));
        }
        StepOutput::line(true, "Success")
    }
}

impl PackageManager for InMemoryPackageManager {
    fn installed_source_dir<'a>(
        &'a self,
        package_name: &'a str,
        user_id: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Option<PathBuf>>> + Send + 'a>> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .await
                .installed
                .get(&(package_name.to_string(), user_id))
                .and_then(|p| p.source_dir.clone()))
        })
    }

    fn uid<'a>(
        &'a self,
        package_name: &'a str,
        user_id: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Option<u32>>> + Send + 'a>> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .await
                .installed
                .get(&(package_name.to_string(), user_id))
                .map(|p| p.uid))
        })
    }

    fn query_installed<'a>(
        &'a self,
        package_name: &'a str,
        user_id: u32,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .await
                .installed
                .contains_key(&(package_name.to_string(), user_id)))
        })
    }

    fn install<'a>(
        &'a self,
        _user_id: u32,
        apk: &'a Path,
    ) -> Pin<Box<dyn Future<Output = StepOutput> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            Self::finish_install(&mut state, vec![apk.to_path_buf()])
        })
    }

    fn create_session<'a>(
        &'a self,
        _user_id: u32,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let id = state.next_session.to_string();
            state.next_session += 1;
            state.sessions.insert(id.clone(), Vec::new());
            Ok(id)
        })
    }

    fn write_session<'a>(
        &'a self,
        session_id: &'a str,
        apk: &'a Path,
    ) -> Pin<Box<dyn Future<Output = StepOutput> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            match state.sessions.get_mut(session_id) {
                Some(parts) => {
                    parts.push(apk.to_path_buf());
                    StepOutput::line(true, "Success: streamed 1 bytes")
                }
                None => StepOutput::line(false, format!("Unknown session {session_id}")),
            }
        })
    }

    fn commit_session<'a>(
        &'a self,
        session_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = StepOutput> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            match state.sessions.remove(session_id) {
                Some(parts) => Self::finish_install(&mut state, parts),
                None => StepOutput::line(false, format!("Unknown session {session_id}")),
            }
        })
    }

    fn force_stop<'a>(
        &'a self,
        package_name: &'a str,
        user_id: u32,
    ) -> Pin<Box<dyn Future<Output = StepOutput> + Send + 'a>> {
        Box::pin(async move {
            self.state
                .lock()
                .await
                .force_stopped
                .push((package_name.to_string(), user_id));
            StepOutput::ok(Vec::new())
        })
    }

    fn runtime_permissions<'a>(
        &'a self,
        package_name: &'a str,
        user_id: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RuntimePermission>>> + Send + 'a>> {
        Box::pin(async move {
            self.state
                .lock()
                .await
                .installed
                .get(&(package_name.to_string(), user_id))
                .map(|p| p.permissions.clone())
                .ok_or_else(|| Error::PackageManager {
                    message: format!("Unable to find package: {package_name}"),
                })
        })
    }

    fn set_permission<'a>(
        &'a self,
        package_name: &'a str,
        user_id: u32,
        permission: &'a RuntimePermission,
    ) -> Pin<Box<dyn Future<Output = StepOutput> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let Some(p) = state.installed.get_mut(&(package_name.to_string(), user_id)) else {
                return StepOutput::line(false, format!("Unknown package: {package_name}"));
            };
            match p.permissions.iter_mut().find(|e| e.name == permission.name) {
                Some(existing) => existing.granted = permission.granted,
                None => p.permissions.push(permission.clone()),
            }
            StepOutput::ok(Vec::new())
        })
    }

    fn ssaid<'a>(
        &'a self,
        package_name: &'a str,
        user_id: u32,
        uid: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .await
                .installed
                .get(&(package_name.to_string(), user_id))
                .filter(|p| p.uid == uid)
                .and_then(|p| p.ssaid.clone()))
        })
    }

    fn set_ssaid<'a>(
        &'a self,
        package_name: &'a str,
        user_id: u32,
        uid: u32,
        ssaid: &'a str,
    ) -> Pin<Box<dyn Future<Output = StepOutput> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            match state
                .installed
                .get_mut(&(package_name.to_string(), user_id))
                .filter(|p| p.uid == uid)
            {
                Some(p) => {
                    p.ssaid = Some(ssaid.to_string());
                    StepOutput::ok(Vec::new())
                }
                None => StepOutput::line(false, format!("No ssaid entry for {package_name}.")),
            }
        })
    }
}
