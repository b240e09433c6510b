//! Presentation helpers for projects: titles, progress, routes and Markdown
//! export of outlines and descriptions.

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{DescriptionContent, Page, Project};

pub const UNTITLED_PROJECT: &str = "Untitled project";

/// How far a project has progressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStage {
    NotStarted,
    NeedsDescriptions,
    NeedsImages,
    Completed,
}

impl ProjectStage {
    pub fn of(project: &Project) -> Self {
        if project.pages.is_empty() {
            ProjectStage::NotStarted
        } else if project.pages.iter().any(|p| p.generated_image_path.is_some()) {
            ProjectStage::Completed
        } else if project.pages.iter().any(|p| p.description_content.is_some()) {
            ProjectStage::NeedsImages
        } else {
            ProjectStage::NeedsDescriptions
        }
    }

    pub fn text(self) -> &'static str {
        match self {
            ProjectStage::NotStarted => "Not started",
            ProjectStage::NeedsDescriptions => "Descriptions pending",
            ProjectStage::NeedsImages => "Images pending",
            ProjectStage::Completed => "Completed",
        }
    }
}

/// Pages sorted by order index; pages without one sort as 0.
pub fn sorted_pages(project: &Project) -> Vec<&Page> {
    let mut pages: Vec<&Page> = project.pages.iter().collect();
    pages.sort_by_key(|p| p.order_index.unwrap_or(0));
    pages
}

/// Idea prompt, else the first page's outline title.
pub fn project_title(project: &Project) -> String {
    if let Some(prompt) = project.idea_prompt.as_deref().filter(|p| !p.is_empty()) {
        return prompt.to_string();
    }
    sorted_pages(project)
        .first()
        .and_then(|p| p.outline_content.as_ref())
        .map(|o| o.title.clone())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| UNTITLED_PROJECT.to_string())
}

pub fn status_text(project: &Project) -> &'static str {
    ProjectStage::of(project).text()
}

/// View a project should open in
pub fn project_route(project: &Project) -> String {
    if project.id.is_empty() {
        return "/".to_string();
    }
    let view = match ProjectStage::of(project) {
        ProjectStage::Completed => "preview",
        ProjectStage::NeedsImages => "detail",
        ProjectStage::NotStarted | ProjectStage::NeedsDescriptions => "outline",
    };
    format!("/project/{}/{}", project.id, view)
}

/// First generated image, with a cache-busting version when the page has one.
pub fn first_page_image(project: &Project) -> Option<String> {
    let page = project
        .pages
        .iter()
        .find(|p| p.generated_image_path.is_some())?;
    let path = page.generated_image_path.as_deref()?;
    Some(match &page.updated_at {
        Some(version) => format!("{}?v={}", path, version),
        None => path.to_string(),
    })
}

pub fn description_text(content: Option<&DescriptionContent>) -> String {
    content.map(DescriptionContent::to_text).unwrap_or_default()
}

fn page_heading(page: &Page, index: usize) -> String {
    let title = page
        .outline_content
        .as_ref()
        .map(|o| o.title.as_str())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("Page {}", index + 1));
    format!("## Page {}: {}\n\n", index + 1, title)
}

pub fn page_outline_markdown(page: &Page, index: usize) -> String {
    let mut md = page_heading(page, index);
    let points = page
        .outline_content
        .as_ref()
        .map(|o| o.points.as_slice())
        .unwrap_or_default();
    if points.is_empty() {
        md.push_str("*No points yet*\n\n");
    } else {
        for point in points {
            md.push_str(&format!("- {}\n", point));
        }
        md.push('\n');
    }
    md
}

pub fn page_description_markdown(page: &Page, index: usize) -> String {
    let mut md = page_heading(page, index);
    let text = description_text(page.description_content.as_ref());
    if text.is_empty() {
        md.push_str("*No description yet*\n\n");
    } else {
        md.push_str(&text);
        md.push_str("\n\n");
    }
    md.push_str("---\n\n");
    md
}

fn document_header(project: &Project, generated_at: DateTime<Utc>) -> String {
    format!(
        "# {}\n\n> Generated: {}\n\n---\n\n",
        project_title(project),
        generated_at.with_timezone(&Local).format("%Y/%m/%d %H:%M:%S")
    )
}

/// Whole outline as Markdown, pages in stored order.
pub fn outline_markdown(project: &Project, generated_at: DateTime<Utc>) -> String {
    let mut md = document_header(project, generated_at);
    for (index, page) in project.pages.iter().enumerate() {
        md.push_str(&page_outline_markdown(page, index));
    }
    md
}

/// All page descriptions as Markdown, pages in stored order.
pub fn descriptions_markdown(project: &Project, generated_at: DateTime<Utc>) -> String {
    let mut md = document_header(project, generated_at);
    for (index, page) in project.pages.iter().enumerate() {
        md.push_str(&page_description_markdown(page, index));
    }
    md
}

fn short_id(project: &Project) -> &str {
    if project.id.is_empty() {
        return "export";
    }
    project
        .id
        .char_indices()
        .nth(8)
        .map_or(project.id.as_str(), |(i, _)| &project.id[..i])
}

pub fn outline_filename(project: &Project) -> String {
    format!("outline_{}.md", short_id(project))
}

pub fn descriptions_filename(project: &Project) -> String {
    format!("descriptions_{}.md", short_id(project))
}

pub fn format_file_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    let size = bytes as f64;
    if size < KB {
        format!("{} B", bytes)
    } else if size < MB {
        format!("{:.1} KB", size / KB)
    } else {
        format!("{:.1} MB", size / MB)
    }
}

/// `YYYY/MM/DD HH:MM` in local time. Unparseable input is returned as is.
pub fn format_date(value: &str) -> String {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return dt.with_timezone(&Local).format("%Y/%m/%d %H:%M").to_string();
    }
    // Backend timestamps without an offset are UTC
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return naive
                .and_utc()
                .with_timezone(&Local)
                .format("%Y/%m/%d %H:%M")
                .to_string();
        }
    }
    value.to_string()
}
