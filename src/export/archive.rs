use super::collect::UserDataExport;
use super::{EXPORT_TTL_DAYS, deref_string, format_bytes};
use crate::errors::ExportError;
use std::fmt;
use std::io::{Cursor, Write};
use zip::CompressionMethod;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

/// Name of the JSON document inside the archive.
pub const ARCHIVE_DATA_FILE: &str = "user_data.json";
/// Name of the explanatory text file inside the archive.
pub const ARCHIVE_README_FILE: &str = "README.txt";

/// Zips the pretty-printed export with a README.
pub fn build_archive(data: &UserDataExport) -> Result<Vec<u8>, ExportError> {
    let json = serde_json::to_vec_pretty(data)?;
    let readme = render_readme(data, json.len());

    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));

    zip.start_file(ARCHIVE_DATA_FILE, options)?;
    zip.write_all(&json)?;
    zip.start_file(ARCHIVE_README_FILE, options)?;
    zip.write_all(readme.as_bytes())?;

    Ok(zip.finish()?.into_inner())
}

fn render_readme(data: &UserDataExport, json_size: usize) -> String {
    let mut readme = String::new();
    // Writing into a String cannot fail.
    let _ = write_readme(&mut readme, data, json_size);
    readme
}

fn write_readme(out: &mut impl fmt::Write, data: &UserDataExport, json_size: usize) -> fmt::Result {
    let profile = &data.profile;
    let info = &data.export_info;
    let name = deref_string(profile.name.as_deref());

    writeln!(out, "YOUR DATA EXPORT")?;
    writeln!(out, "================")?;
    writeln!(out)?;
    writeln!(out, "Account:      {}", profile.email)?;
    if !name.is_empty() {
        writeln!(out, "Name:         {name}")?;
    }
    writeln!(out, "Export ID:    {}", info.export_id)?;
    writeln!(out, "Generated at: {}", info.generated_at.to_rfc3339())?;
    writeln!(out, "Format:       {}", info.format_version)?;
    writeln!(out)?;
    writeln!(out, "CONTENTS")?;
    writeln!(out, "--------")?;
    writeln!(
        out,
        "{ARCHIVE_DATA_FILE} ({}): everything we store about your account",
        format_bytes(json_size as u64)
    )?;
    writeln!(out, "as pretty-printed JSON. Sections you have no data in are left out.")?;
    writeln!(out)?;

    let sections = [
        ("profile", "account details", 1),
        ("preferences", "theme, language and notification settings", usize::from(data.preferences.is_some())),
        ("sessions", "signed-in devices", data.sessions.len()),
        ("login_history", "most recent 100 sign-in attempts", data.login_history.len()),
        ("two_factor", "whether two-factor authentication is on", usize::from(data.two_factor.is_some())),
        ("api_keys", "API key names and prefixes", data.api_keys.len()),
        ("oauth_providers", "linked sign-in providers", data.oauth_providers.len()),
        ("files", "metadata of uploaded files", data.files.len()),
        ("organizations", "organization memberships and roles", data.organizations.len()),
        ("audit_log", "most recent 500 account events", data.audit_log.len()),
    ];
    for (key, description, count) in sections.into_iter().filter(|(_, _, count)| *count > 0) {
        writeln!(out, "  {key:<16} {description} ({count})")?;
    }

    writeln!(out)?;
    writeln!(out, "Passwords, two-factor secrets, recovery codes, API keys, session")?;
    writeln!(out, "tokens and OAuth tokens are never included.")?;
    writeln!(out)?;
    writeln!(
        out,
        "This download is available for {EXPORT_TTL_DAYS} days, after which it is deleted."
    )
}
