//! HTML for the two-tab demo page and its result cards.
//!
//! Answers come from a model and are escaped before they reach the page.

use std::fmt::Write;

pub const PAGE_TITLE: &str = "Tanzu/Vmware LLM Analytics with Postgres and Huggingface Demo";
pub const PAGE_SUBTITLE: &str =
    "Demonstration of question-answering transformers using neutral networks and Vmware Tanzu";

const STYLE: &str = r#"<style>
@import url('https://fonts.googleapis.com/css2?family=Nanum Gothic');
@import url('https://maxcdn.bootstrapcdn.com/font-awesome/4.4.0/css/font-awesome.min.css');
@import url('https://cdn.jsdelivr.net/npm/bootstrap@4.0.0/dist/css/bootstrap.min.css');
html, body {
   font-family: 'Nanum Gothic';
}
h1.demotitle {
   color: #6a6161;
}
div.card {
    background: none;
}
a.demobody {
  text-decoration: none;
  padding: 4px;
  font-size: small;
}
.fa-thumbs-up, .fa-thumbs-down {
    color: orange;
}
.fa-thumbs-up:hover, .fa-thumbs-down:hover {
    color: gray;
}
</style>"#;

const RANK_FOOTER: &str = "<div class='card-footer text-muted'>Rank answer\
<span class='fa-stack fa-2x'><i class='fa fa-circle fa-stack-2x'></i>\
<i class='fa fa-thumbs-up fa-stack-1x fa-inverse'></i></span>\
<span class='fa-stack fa-2x'><i class='fa fa-circle fa-stack-2x'></i>\
<i class='fa fa-thumbs-down fa-stack-1x fa-inverse'></i></span></div>";

/// Page tabs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tab {
    Summarize,
    Ask,
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// Summary of an uploaded file or of a question.
pub fn summary_card(answer: &str) -> String {
    format!(
        "<div class='card border-light mb-3'><div class='card-body'>\
<h4 class='card-title'>Summary</h4><p class='card-text'>{}</p>{}</div></div>",
        escape_html(answer),
        RANK_FOOTER
    )
}

/// Name of the model that produced the next card.
pub fn model_name_card(model_name: &str) -> String {
    format!(
        "<div class='card border-light mb-3'><div class='card-body'>\
<h5 class='card-title'>Model Name</h5><p class='card-text'>{}</p></div></div>",
        escape_html(model_name)
    )
}

/// Best matching document excerpt with a link to the document.
pub fn matched_documents_card(answer: &str, doc_url: Option<&str>) -> String {
    let mut card = format!(
        "<div class='card border-light mb-3'><div class='card-body'>\
<h4 class='card-title'>Matched Documents</h4>\
<p class='card-text' style='font-style:italic;'>\"{}...\"</p>",
        escape_html(answer)
    );
    if let Some(url) = doc_url.filter(|u| !u.trim().is_empty()) {
        let _ = write!(
            card,
            "<a class='demobody' href=\"{}\" target=\"blank\">View Document</a>",
            escape_html(url)
        );
    }
    card.push_str(RANK_FOOTER);
    card.push_str("</div></div>");
    card
}

pub fn error_card(message: &str) -> String {
    format!(
        "<div class='card border-danger mb-3'><div class='card-body'>\
<h5 class='card-title text-danger'>Request failed</h5><p class='card-text'>{}</p></div></div>",
        escape_html(message)
    )
}

/// Full page with `fragment` shown under the `active` tab.
pub fn page(active: Tab, fragment: Option<&str>) -> String {
    let (summarize_result, ask_result) = match active {
        Tab::Summarize => (fragment.unwrap_or_default(), ""),
        Tab::Ask => ("", fragment.unwrap_or_default()),
    };
    let tab_class = |tab: Tab| if tab == active { "nav-link active" } else { "nav-link" };
    let pane_class = |tab: Tab| {
        if tab == active {
            "tab-pane fade show active"
        } else {
            "tab-pane fade"
        }
    };

    let mut html = String::new();
    let _ = write!(
        html,
        "<!DOCTYPE html>\n<html><head><meta charset='utf-8'><title>{title}</title>{style}</head>\n\
<body><div class='container'>\n\
<h1 class='demotitle'>{title}</h1>\n<p>{subtitle}</p>\n",
        title = PAGE_TITLE,
        style = STYLE,
        subtitle = PAGE_SUBTITLE,
    );
    let _ = write!(
        html,
        "<ul class='nav nav-tabs'>\
<li class='nav-item'><a class='{}' href='/#summarize'>Text Summarization</a></li>\
<li class='nav-item'><a class='{}' href='/#ask'>AI Bot</a></li></ul>\n",
        tab_class(Tab::Summarize),
        tab_class(Tab::Ask),
    );
    let _ = write!(
        html,
        "<div class='tab-content'>\n\
<div class='{}' id='summarize'>\
<form method='post' action='/summarize' enctype='multipart/form-data'>\
<label for='file'>Select a PDF file to summarize</label> \
<input type='file' id='file' name='file' required> \
<button type='submit' class='btn btn-light'>Summarize</button></form>\
<div id='summarize-result'>{}</div></div>\n",
        pane_class(Tab::Summarize),
        summarize_result,
    );
    let _ = write!(
        html,
        "<div class='{}' id='ask'>\
<p>This bot uses <b>on-premise data</b> to provide information about VMware technologies.<br/></p>\
<form method='post' action='/ask'>\
<label for='question'>Your question</label> \
<input type='text' id='question' name='question' required> \
<button type='submit' class='btn btn-light'>Ask</button></form>\
<div id='ask-result'>{}</div></div>\n</div>\n</div></body></html>\n",
        pane_class(Tab::Ask),
        ask_result,
    );
    html
}
