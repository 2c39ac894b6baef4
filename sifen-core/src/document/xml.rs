//! libxml helpers shared by the signer and the QR embedder.
pub mod constants;

use libxml::{
    parser::Parser,
    tree::{Document, Node, c14n},
    xpath,
};

pub(crate) fn parse(xml: &str) -> Result<Document, String> {
    Parser::default()
        .parse_string(xml)
        .map_err(|e| format!("XML parse error: {e:?}"))
}

/// Every element whose local name is `local_name`, in document order.
pub(crate) fn elements_named(doc: &Document, local_name: &str) -> Result<Vec<Node>, String> {
    let name = xpath_literal(local_name)?;
    evaluate(doc, &format!("//*[local-name()='{name}']"))
}

pub(crate) fn first_named(doc: &Document, local_name: &str) -> Result<Option<Node>, String> {
    Ok(elements_named(doc, local_name)?.into_iter().next())
}

/// Every element carrying `Id="{id}"`.
pub(crate) fn elements_with_id(doc: &Document, id: &str) -> Result<Vec<Node>, String> {
    let id = xpath_literal(id)?;
    evaluate(doc, &format!("//*[@Id='{id}']"))
}

/// Descendants of the element with `Id="{id}"` whose local name is `local_name`.
pub(crate) fn descendants_named(
    doc: &Document,
    id: &str,
    local_name: &str,
) -> Result<Vec<Node>, String> {
    let id = xpath_literal(id)?;
    let name = xpath_literal(local_name)?;
    evaluate(doc, &format!("//*[@Id='{id}']//*[local-name()='{name}']"))
}

fn evaluate(doc: &Document, expr: &str) -> Result<Vec<Node>, String> {
    let ctx = xpath::Context::new(doc).map_err(|e| format!("XPath context error: {e:?}"))?;
    Ok(ctx
        .evaluate(expr)
        .map_err(|e| format!("XPath error for {expr}: {e:?}"))?
        .get_nodes_as_vec())
}

fn xpath_literal(value: &str) -> Result<&str, String> {
    if value.contains('\'') {
        return Err(format!("value cannot be used in an XPath literal: {value}"));
    }
    Ok(value)
}

/// Unlinks every node and returns how many were removed.
pub(crate) fn remove_all(nodes: Vec<Node>) -> usize {
    let count = nodes.len();
    for mut node in nodes {
        node.unlink();
    }
    count
}

fn exclusive_options() -> c14n::CanonicalizationOptions {
    c14n::CanonicalizationOptions {
        mode: c14n::CanonicalizationMode::ExclusiveCanonical1_0,
        inclusive_ns_prefixes: vec![],
        with_comments: false,
    }
}

/// Exclusive C14N of the subtree rooted at `node`, namespace context included.
pub(crate) fn canonicalize_node(node: &mut Node) -> Result<String, String> {
    node.canonicalize(exclusive_options())
        .map_err(|e| format!("Failed to canonicalize node: {e:?}"))
}

pub(crate) fn canonicalize_document(doc: &Document) -> Result<String, String> {
    doc.canonicalize(exclusive_options(), None)
        .map_err(|e| format!("Failed to canonicalize xml: {e:?}"))
}

pub(crate) fn import_fragment(doc: &mut Document, xml: &str) -> Result<Node, String> {
    let fragment = parse(xml)?;
    let mut node = fragment
        .get_root_element()
        .ok_or_else(|| "missing fragment root".to_string())?;
    node.unlink();
    doc.import_node(&mut node)
        .map_err(|_| "failed to import fragment".to_string())
}

/// Replaces the children of `node` with a single text node holding `text` verbatim.
pub(crate) fn replace_text(doc: &Document, node: &mut Node, text: &str) -> Result<(), String> {
    remove_all(node.get_child_nodes());
    let mut text_node =
        Node::new_text(text, doc).map_err(|e| format!("failed to create text node: {e:?}"))?;
    node.add_child(&mut text_node).map_err(|e| e.to_string())
}

pub(crate) fn next_element_sibling(node: &Node) -> Option<Node> {
    let mut current = node.get_next_sibling();
    while let Some(sibling) = current {
        if sibling.is_element_node() {
            return Some(sibling);
        }
        current = sibling.get_next_sibling();
    }
    None
}

/// Serialized document without the XML declaration.
pub(crate) fn serialize(doc: &Document) -> String {
    let text = doc.to_string();
    let body = text.trim_start();
    let body = match body.strip_prefix("<?xml") {
        Some(rest) => rest
            .find("?>")
            .map(|end| rest[end + 2..].trim_start())
            .unwrap_or(body),
        None => body,
    };
    body.trim_end().to_string()
}
