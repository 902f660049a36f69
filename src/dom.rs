use std::sync::Arc;

use anyhow::Result;
use headless_chrome::Tab;

/// Upper bound on the snapshot text handed to the planner.
const PAGE_OUTLINE_MAX_CHARS: usize = 4000;

/// JavaScript evaluated in the page to produce a compact outline of what is
/// interactable. Emits one line per element with a usable CSS selector, so
/// the planner can target elements it has actually seen.
const OUTLINE_JS: &str = r#"
(() => {
  const lines = [];
  const selectorFor = (el) => {
    if (el.id) return '#' + CSS.escape(el.id);
    if (el.name) return el.tagName.toLowerCase() + '[name="' + el.name + '"]';
    const parent = el.parentElement;
    if (!parent) return el.tagName.toLowerCase();
    const siblings = [...parent.children].filter(c => c.tagName === el.tagName);
    const nth = siblings.indexOf(el) + 1;
    return el.tagName.toLowerCase() + ':nth-of-type(' + nth + ')';
  };
  const visible = (el) => {
    const rect = el.getBoundingClientRect();
    return rect.width > 0 && rect.height > 0;
  };
  document.querySelectorAll('a[href], button, input, textarea, select').forEach(el => {
    if (!visible(el) || lines.length >= 120) return;
    const tag = el.tagName.toLowerCase();
    let label = '';
    if (tag === 'input' || tag === 'textarea') {
      label = 'type=' + (el.type || 'text') + ' placeholder="' + (el.placeholder || '') + '"';
    } else if (tag === 'select') {
      label = '[' + [...el.options].slice(0, 8).map(o => o.text.trim()).join('|') + ']';
    } else {
      label = '"' + (el.textContent || '').trim().replace(/\s+/g, ' ').slice(0, 60) + '"';
    }
    lines.push(tag + ' ' + selectorFor(el) + ' ' + label);
  });
  document.querySelectorAll('h1, h2, h3').forEach(el => {
    if (lines.length >= 150) return;
    const text = (el.textContent || '').trim().replace(/\s+/g, ' ').slice(0, 80);
    if (text) lines.push('# ' + text);
  });
  return lines.join('\n');
})()
"#;

/// Capture a truncated outline of the current page for replanning context.
pub fn capture_page_outline(tab: &Arc<Tab>) -> Result<String> {
    let result = tab.evaluate(OUTLINE_JS, false)?;
    let raw = result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default();

    if raw.chars().count() > PAGE_OUTLINE_MAX_CHARS {
        let truncated: String = raw.chars().take(PAGE_OUTLINE_MAX_CHARS).collect();
        Ok(format!("{truncated}\n... [outline truncated]"))
    } else {
        Ok(raw)
    }
}

/// The URL the tab currently shows.
pub fn current_url(tab: &Arc<Tab>) -> Result<String> {
    let result = tab.evaluate("window.location.href", false)?;
    Ok(result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| "about:blank".to_string()))
}

pub fn page_title(tab: &Arc<Tab>) -> Result<String> {
    let result = tab.evaluate("document.title", false)?;
    Ok(result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default())
}
