use chrono::Utc;
use common::{error::AppError, storage::types::chunk::ImageInfo};
use minijinja::{context, Environment, ErrorKind};

use crate::turn::Passage;

/// Template instantiated with the merged passages for the grounded prompt.
pub const DEFAULT_CONTEXT_TEMPLATE: &str = "\
You are a helpful assistant. Answer the user's question using only the \
provided context passages. Cite nothing that is not in the context.

Current time: {{ current_time }} ({{ current_week }})

Context:
{% for context in contexts %}[{{ loop.index }}] {{ context }}
{% endfor %}
Question: {{ query }}";

/// Used when retrieval found nothing and the session falls back to the model.
pub const NO_CONTEXT_TEMPLATE: &str = "\
You are a helpful assistant. No reference material is available for this \
question; answer from general knowledge and say so when you are unsure.

Current time: {{ current_time }} ({{ current_week }})

Question: {{ query }}";

/// Instantiate `template` with the query and annotated passages.
/// Parse faults map to `TemplateParse`, render faults to `TemplateExecute`.
pub fn render_context_template(
    template: &str,
    query: &str,
    contexts: &[String],
) -> Result<String, AppError> {
    let env = Environment::new();
    let now = Utc::now();

    env.render_str(
        template,
        context! {
            query => query,
            contexts => contexts,
            current_time => now.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            current_week => now.format("%A").to_string(),
        },
    )
    .map_err(|err| match err.kind() {
        ErrorKind::SyntaxError => AppError::TemplateParse(err.to_string()),
        _ => AppError::TemplateExecute(err.to_string()),
    })
}

/// Enrich a passage's content with its image annotations: caption and OCR
/// lines directly after each inlined markdown image, and an
/// "Additional image information" block for images that only exist in the
/// chunk's image metadata.
pub fn annotate_passage(passage: &Passage) -> String {
    let Some(images) = passage.image_info.as_ref().filter(|info| !info.is_empty()) else {
        return passage.content.clone();
    };

    let links = find_image_links(&passage.content);
    let mut annotated = String::with_capacity(passage.content.len());
    let mut cursor = 0usize;

    for link in &links {
        annotated.push_str(passage.content.get(cursor..link.end).unwrap_or_default());
        cursor = link.end;
        if let Some(image) = match_image(images, &link.url) {
            push_image_lines(&mut annotated, image);
        }
    }
    annotated.push_str(passage.content.get(cursor..).unwrap_or_default());

    let extra: Vec<&ImageInfo> = images
        .iter()
        .filter(|image| {
            !links
                .iter()
                .any(|link| image.url == link.url || image.original_url.as_deref() == Some(&link.url))
        })
        .filter(|image| image.caption.is_some() || image.ocr_text.is_some())
        .collect();

    if !extra.is_empty() {
        annotated.push_str("\nAdditional image information:");
        for image in extra {
            push_image_lines(&mut annotated, image);
        }
    }

    annotated
}

fn push_image_lines(out: &mut String, image: &ImageInfo) {
    if let Some(caption) = image.caption.as_deref().filter(|c| !c.is_empty()) {
        out.push_str("\nImage caption: ");
        out.push_str(caption);
    }
    if let Some(ocr) = image.ocr_text.as_deref().filter(|o| !o.is_empty()) {
        out.push_str("\nImage text: ");
        out.push_str(ocr);
    }
}

fn match_image<'a>(images: &'a [ImageInfo], url: &str) -> Option<&'a ImageInfo> {
    images
        .iter()
        .find(|image| image.url == url || image.original_url.as_deref() == Some(url))
}

struct ImageLink {
    url: String,
    /// Byte offset one past the closing parenthesis.
    end: usize,
}

/// Locate markdown image links `![alt](url)` without touching anything else.
fn find_image_links(content: &str) -> Vec<ImageLink> {
    let mut links = Vec::new();
    let bytes = content.as_bytes();
    let mut position = 0usize;

    while let Some(start) = content.get(position..).and_then(|rest| rest.find("![")) {
        let open = position.saturating_add(start);
        let Some(alt_close) = content.get(open..).and_then(|rest| rest.find("](")) else {
            break;
        };
        let url_start = open.saturating_add(alt_close).saturating_add(2);
        let Some(close) = content.get(url_start..).and_then(|rest| rest.find(')')) else {
            break;
        };
        let url_end = url_start.saturating_add(close);

        // Guard against a stray "![" with no proper link body.
        if url_end > url_start || bytes.get(url_start) == Some(&b')') {
            links.push(ImageLink {
                url: content.get(url_start..url_end).unwrap_or_default().to_owned(),
                end: url_end.saturating_add(1),
            });
        }
        position = url_end.saturating_add(1);
    }

    links
}

/// Annotated context strings for every passage, in merge order.
pub fn build_contexts(passages: &[Passage]) -> Vec<String> {
    passages.iter().map(annotate_passage).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::retrieval::MatchType;

    fn passage(content: &str, image_info: Option<Vec<ImageInfo>>) -> Passage {
        Passage {
            chunk_id: "c1".to_string(),
            knowledge_id: "k1".to_string(),
            chunk_index: 0,
            content: content.to_string(),
            score: 0.9,
            match_type: MatchType::Vector,
            image_info,
        }
    }

    fn image(url: &str, caption: Option<&str>, ocr: Option<&str>) -> ImageInfo {
        ImageInfo {
            url: url.to_string(),
            original_url: None,
            caption: caption.map(str::to_owned),
            ocr_text: ocr.map(str::to_owned),
            span: None,
        }
    }

    #[test]
    fn renders_default_template_with_contexts() {
        let rendered = render_context_template(
            DEFAULT_CONTEXT_TEMPLATE,
            "Tell me about comets.",
            &["COMET is a short-period object.".to_string()],
        )
        .expect("render");

        assert!(rendered.contains("Tell me about comets."));
        assert!(rendered.contains("[1] COMET is a short-period object."));
        assert!(rendered.contains("Current time:"));
    }

    #[test]
    fn syntax_error_maps_to_template_parse() {
        let result = render_context_template("{% for x in %}", "q", &[]);
        assert!(matches!(result, Err(AppError::TemplateParse(_))));
    }

    #[test]
    fn runtime_error_maps_to_template_execute() {
        let result = render_context_template("{{ query|no_such_filter }}", "q", &[]);
        assert!(matches!(result, Err(AppError::TemplateExecute(_))));
    }

    #[test]
    fn inline_image_gets_caption_and_ocr_lines_after_the_link() {
        let passage = passage(
            "Diagram: ![arch](http://img/a.png) shows the flow.",
            Some(vec![image(
                "http://img/a.png",
                Some("architecture overview"),
                Some("ingest -> index -> answer"),
            )]),
        );

        let annotated = annotate_passage(&passage);
        assert_eq!(
            annotated,
            "Diagram: ![arch](http://img/a.png)\n\
             Image caption: architecture overview\n\
             Image text: ingest -> index -> answer shows the flow."
        );
    }

    #[test]
    fn non_inlined_images_land_in_an_additional_block() {
        let passage = passage(
            "Plain text without links.",
            Some(vec![image("http://img/b.png", Some("sidebar chart"), None)]),
        );

        let annotated = annotate_passage(&passage);
        assert!(annotated.starts_with("Plain text without links."));
        assert!(annotated.contains("Additional image information:"));
        assert!(annotated.contains("Image caption: sidebar chart"));
    }

    #[test]
    fn passage_without_images_is_untouched() {
        let passage = passage("No images here.", None);
        assert_eq!(annotate_passage(&passage), "No images here.");
    }

    #[test]
    fn images_without_caption_or_ocr_are_skipped_in_additional_block() {
        let passage = passage(
            "Body.",
            Some(vec![image("http://img/empty.png", None, None)]),
        );
        let annotated = annotate_passage(&passage);
        assert!(!annotated.contains("Additional image information"));
    }

    #[test]
    fn finds_multiple_image_links() {
        let links = find_image_links("a ![x](u1) b ![y](u2) c");
        let urls: Vec<&str> = links.iter().map(|l| l.url.as_str()).collect();
        assert_eq!(urls, vec!["u1", "u2"]);
    }
}
