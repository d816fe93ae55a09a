//! PDF support via Poppler's `pdfinfo` and `pdftocairo` CLI tools.

use std::{collections::BTreeMap, sync::LazyLock};

use regex::Regex;
use tokio::{fs, process::Command, sync::Semaphore};

use crate::{async_utils::check_for_command_failure, prelude::*};

use super::PageImage;

/// Lines of Poppler output that indicate a real failure.
static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// Poppler complains about these, but still renders the page fine.
static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// One `pdftocairo` per CPU core. Each one keeps a core busy on its own.
static RASTERIZE_PERMITS: LazyLock<Semaphore> =
    LazyLock::new(|| Semaphore::new(num_cpus::get()));

/// Does this line contain an error?
fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// Get the number of pages in a PDF file.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn get_pdf_page_count(path: &Path) -> Result<usize> {
    let output = Command::new("pdfinfo")
        .arg(path)
        .output()
        .await
        .with_context(|| format!("failed to run pdfinfo on {:?}", path.display()))?;
    check_for_command_failure("pdfinfo", &output, None)?;

    let output =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    parse_pdfinfo_page_count(&output).with_context(|| {
        format!(
            "failed to parse page count for {:?} from pdfinfo output",
            path.display()
        )
    })
}

/// Extract the `Pages:` property from `pdfinfo` output.
fn parse_pdfinfo_page_count(output: &str) -> Result<usize> {
    let mut properties = BTreeMap::new();
    for line in output.lines() {
        let mut parts = line.splitn(2, ':');
        let key = parts.next().unwrap_or("").trim();
        let value = parts.next().unwrap_or("").trim();
        properties.insert(key, value);
    }
    let pages = properties
        .get("Pages")
        .ok_or_else(|| anyhow!("no page count in pdfinfo output"))?;
    Ok(pages.parse::<usize>()?)
}

/// Rasterize a single PDF page to PNG.
#[instrument(level = "debug", skip_all, fields(path = %path.display(), page = page_idx, dpi = dpi))]
pub async fn rasterize_pdf_page(path: &Path, page_idx: usize, dpi: u32) -> Result<PageImage> {
    let tmpdir = tempfile::TempDir::with_prefix("page")?;
    // `pdftocairo -singlefile` appends the extension itself.
    let out_prefix = tmpdir.path().join("page");

    // Poppler uses 1-based, inclusive page ranges.
    let page_number = (page_idx + 1).to_string();
    let mut cmd = Command::new("pdftocairo");
    cmd.arg("-png")
        .arg("-r")
        .arg(dpi.to_string())
        .arg("-f")
        .arg(&page_number)
        .arg("-l")
        .arg(&page_number)
        .arg("-singlefile")
        .arg(path)
        .arg(&out_prefix);

    let permit = RASTERIZE_PERMITS
        .acquire()
        .await
        .context("could not acquire rasterization permit")?;
    let output = cmd
        .output()
        .await
        .with_context(|| format!("failed to run pdftocairo on {:?}", path.display()))?;
    drop(permit);
    check_for_command_failure("pdftocairo", &output, Some(&is_error_line))?;

    let png_path = out_prefix.with_extension("png");
    let data = fs::read(&png_path)
        .await
        .with_context(|| format!("failed to read rasterized page {:?}", png_path.display()))?;
    Ok(PageImage::new("image/png", data))
}
