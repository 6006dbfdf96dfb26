// Integration tests for query key hashing

use querykit::{KeyValue, QueryClient, QueryFilters, QueryKey};
use serde::Serialize;

fn todos(props: &[(&str, KeyValue)]) -> color_eyre::Result<QueryKey> {
    let object = KeyValue::object(props.iter().cloned());
    Ok(QueryKey::new(vec!["todos".into(), object])?)
}

#[test]
fn test_object_property_order_is_ignored() -> color_eyre::Result<()> {
    let a = todos(&[("status", "done".into()), ("page", 1.into())])?;
    let b = todos(&[("page", 1.into()), ("status", "done".into())])?;

    assert_eq!(a.hash(), b.hash());
    assert_eq!(a, b);
    Ok(())
}

#[test]
fn test_array_order_matters() -> color_eyre::Result<()> {
    let a = QueryKey::new(vec!["todos".into(), "done".into(), 1.into()])?;
    let b = QueryKey::new(vec!["todos".into(), 1.into(), "done".into()])?;

    assert_ne!(a.hash(), b.hash());
    Ok(())
}

#[test]
fn test_undefined_properties_and_elements() -> color_eyre::Result<()> {
    let with_undefined = todos(&[("page", 1.into()), ("filter", KeyValue::Undefined)])?;
    let without = todos(&[("page", 1.into())])?;
    assert_eq!(with_undefined.hash(), without.hash());

    let bare_undefined = QueryKey::new(vec!["todos".into(), KeyValue::Undefined])?;
    let bare_null = QueryKey::new(vec!["todos".into(), KeyValue::Null])?;
    let shorter = QueryKey::new(vec!["todos".into()])?;
    assert_ne!(bare_undefined.hash(), bare_null.hash());
    assert_ne!(bare_undefined.hash(), shorter.hash());
    Ok(())
}

#[test]
fn test_serializable_keys_match_native_keys() -> color_eyre::Result<()> {
    #[derive(Serialize)]
    struct Filter<'a> {
        status: &'a str,
        page: u32,
    }

    let from_serde = QueryKey::from_serialize(&("todos", Filter { status: "done", page: 1 }))?;
    let native = todos(&[("page", 1.into()), ("status", "done".into())])?;
    assert_eq!(from_serde.hash(), native.hash());
    Ok(())
}

#[tokio::test]
async fn test_equivalent_keys_share_a_cache_entry() -> color_eyre::Result<()> {
    let client = QueryClient::new();
    let a = todos(&[("status", "done".into()), ("page", 1.into())])?;
    let b = todos(&[("page", 1.into()), ("status", "done".into())])?;

    client.set_query_data(a, |_: Option<&u32>| 7)?;
    assert_eq!(client.get_query_data::<u32>(&b).as_deref(), Some(&7));
    assert_eq!(client.cache().len(), 1);

    // prefix filters see through to the object element
    let matched = client.cache().find_all(&QueryFilters::key("todos"));
    assert_eq!(matched.len(), 1);
    Ok(())
}
