//! Output formatting.
//!
//! Stdout carries only the structured payload; logs, warnings, and progress
//! all go to stderr. The JSON schema per item is
//! `{docid?, score, file, title, context?, alsoIn?, body, snippet}`.

use crate::search::SearchHit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Csv,
    Md,
    Xml,
    /// File list only, one virtual path per line.
    Files,
}

impl OutputFormat {
    /// True for formats consumed by machines, where stderr must carry all
    /// diagnostics.
    pub fn is_machine(&self) -> bool {
        !matches!(self, OutputFormat::Text)
    }
}

/// Render hits in the requested format. `full` includes whole bodies in
/// the human format instead of snippets.
pub fn render_results(hits: &[SearchHit], format: OutputFormat, full: bool) -> String {
    match format {
        OutputFormat::Text => render_text(hits, full),
        OutputFormat::Json => render_json(hits),
        OutputFormat::Csv => render_csv(hits),
        OutputFormat::Md => render_md(hits, full),
        OutputFormat::Xml => render_xml(hits),
        OutputFormat::Files => render_files(hits),
    }
}

fn render_text(hits: &[SearchHit], full: bool) -> String {
    if hits.is_empty() {
        return "No results.".to_string();
    }
    let mut out = String::new();
    for (i, hit) in hits.iter().enumerate() {
        out.push_str(&format!("{}. [{:.2}] {}  {}\n", i + 1, hit.score, hit.title, hit.file));
        if let Some(docid) = &hit.docid {
            out.push_str(&format!("   #{docid}\n"));
        }
        if let Some(context) = &hit.context {
            out.push_str(&format!("   context: {context}\n"));
        }
        for other in &hit.also_in {
            out.push_str(&format!("   also in: {other}\n"));
        }
        let text = if full { &hit.body } else { &hit.snippet };
        for line in text.lines() {
            out.push_str("   | ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

fn render_json(hits: &[SearchHit]) -> String {
    serde_json::to_string_pretty(hits).unwrap_or_else(|_| "[]".to_string())
}

fn render_csv(hits: &[SearchHit]) -> String {
    let mut out = String::from("docid,score,file,title,context,body\n");
    for hit in hits {
        out.push_str(&format!(
            "{},{:.4},{},{},{},{}\n",
            csv_escape(hit.docid.as_deref().unwrap_or("")),
            hit.score,
            csv_escape(&hit.file),
            csv_escape(&hit.title),
            csv_escape(hit.context.as_deref().unwrap_or("")),
            csv_escape(&hit.body),
        ));
    }
    out
}

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn render_md(hits: &[SearchHit], full: bool) -> String {
    let mut out = String::new();
    for hit in hits {
        out.push_str(&format!("## {} — {}\n\n", hit.title, hit.file));
        if let Some(docid) = &hit.docid {
            out.push_str(&format!("`#{docid}` score {:.2}", hit.score));
            out.push('\n');
            out.push('\n');
        }
        if let Some(context) = &hit.context {
            out.push_str(&format!("> {context}\n\n"));
        }
        let text = if full { &hit.body } else { &hit.snippet };
        out.push_str(text);
        out.push_str("\n\n");
    }
    out.trim_end().to_string()
}

fn render_xml(hits: &[SearchHit]) -> String {
    let mut out = String::from("<results>\n");
    for hit in hits {
        out.push_str("  <result>\n");
        if let Some(docid) = &hit.docid {
            out.push_str(&format!("    <docid>{}</docid>\n", xml_escape(docid)));
        }
        out.push_str(&format!("    <score>{:.4}</score>\n", hit.score));
        out.push_str(&format!("    <file>{}</file>\n", xml_escape(&hit.file)));
        out.push_str(&format!("    <title>{}</title>\n", xml_escape(&hit.title)));
        if let Some(context) = &hit.context {
            out.push_str(&format!("    <context>{}</context>\n", xml_escape(context)));
        }
        for other in &hit.also_in {
            out.push_str(&format!("    <alsoIn>{}</alsoIn>\n", xml_escape(other)));
        }
        out.push_str(&format!("    <body>{}</body>\n", xml_escape(&hit.body)));
        out.push_str("  </result>\n");
    }
    out.push_str("</results>");
    out
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn render_files(hits: &[SearchHit]) -> String {
    hits.iter()
        .map(|h| h.file.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit() -> SearchHit {
        SearchHit {
            docid: Some("abc123".into()),
            score: 0.87,
            file: "qmd://notes/pasta.md".into(),
            title: "Pasta".into(),
            context: Some("cooking notes".into()),
            also_in: vec!["qmd://backup/pasta.md".into()],
            body: "pasta water, \"binds\" sauce\nsecond line".into(),
            snippet: "pasta water…".into(),
        }
    }

    #[test]
    fn json_schema_fields() {
        let rendered = render_json(&[hit()]);
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        let item = &value[0];
        assert_eq!(item["docid"], "abc123");
        assert_eq!(item["file"], "qmd://notes/pasta.md");
        assert_eq!(item["alsoIn"][0], "qmd://backup/pasta.md");
        assert!(item["score"].is_number());
        assert!(item.get("snippet").is_some());
    }

    #[test]
    fn json_omits_empty_optionals() {
        let mut h = hit();
        h.docid = None;
        h.context = None;
        h.also_in.clear();
        let value: serde_json::Value =
            serde_json::from_str(&render_json(&[h])).unwrap();
        assert!(value[0].get("docid").is_none());
        assert!(value[0].get("context").is_none());
        assert!(value[0].get("alsoIn").is_none());
    }

    #[test]
    fn csv_escapes_quotes_and_commas() {
        let rendered = render_csv(&[hit()]);
        assert!(rendered.starts_with("docid,score,file,title,context,body\n"));
        assert!(rendered.contains("\"pasta water, \"\"binds\"\" sauce\nsecond line\""));
    }

    #[test]
    fn xml_escapes_entities() {
        let mut h = hit();
        h.title = "a < b & c".into();
        let rendered = render_xml(&[h]);
        assert!(rendered.contains("<title>a &lt; b &amp; c</title>"));
        assert!(rendered.starts_with("<results>"));
    }

    #[test]
    fn files_format_lists_paths_only() {
        let rendered = render_files(&[hit()]);
        assert_eq!(rendered, "qmd://notes/pasta.md");
    }

    #[test]
    fn empty_text_output() {
        assert_eq!(render_text(&[], false), "No results.");
    }
}
