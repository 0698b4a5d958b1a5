use std::sync::LazyLock;

use regex::Regex;

use crate::models::DocumentReference;

static DOCUMENTS_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<documents>(.*?)</documents>").expect("valid documents regex"));
static RELATED_QUESTIONS_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<related_questions>(.*?)</related_questions>").expect("valid related questions regex")
});

/// A finished assistant reply split into display text and attachments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedContent {
    pub content: String,
    pub documents: Vec<DocumentReference>,
    pub related_questions: Vec<String>,
}

fn block_lines(block: &str) -> impl Iterator<Item = &str> {
    block.lines().map(str::trim).filter(|l| !l.is_empty())
}

fn pdf_stem(file: &str) -> Option<&str> {
    let split = file.len().checked_sub(4)?;
    let ext = file.get(split..)?;
    (split > 0 && ext.eq_ignore_ascii_case(".pdf")).then(|| &file[..split])
}

/// Pulls the `<documents>` and `<related_questions>` blocks out of `raw`.
///
/// Document lines have the form `name.pdf | id`; anything that is not a PDF
/// is ignored.
pub fn parse_assistant_content(raw: &str) -> ParsedContent {
    let mut content = raw.to_string();
    let mut documents = Vec::new();
    let mut related_questions = Vec::new();

    if let Some(caps) = DOCUMENTS_BLOCK.captures(raw) {
        for line in block_lines(&caps[1]) {
            let mut parts = line.splitn(2, '|').map(str::trim);
            let (Some(file), Some(id)) = (parts.next(), parts.next()) else {
                continue;
            };
            let Some(stem) = pdf_stem(file) else {
                continue;
            };
            if id.is_empty() {
                continue;
            }
            documents.push(DocumentReference {
                filename: stem.to_string(),
                document_id: id.to_string(),
            });
        }
        content = content.replacen(&caps[0], "", 1).trim().to_string();
    }

    if let Some(caps) = RELATED_QUESTIONS_BLOCK.captures(&content) {
        related_questions.extend(block_lines(&caps[1]).map(str::to_string));
        let whole = caps[0].to_string();
        content = content.replacen(&whole, "", 1).trim().to_string();
    }

    ParsedContent { content, documents, related_questions }
}
