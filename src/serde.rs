use core::fmt;
use core::hash::Hash;
use core::marker::PhantomData;

use serde::de::{Deserialize, MapAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde::Deserializer;

use crate::WispMap;

pub struct WispMapVisitor<K, V> {
    marker: PhantomData<fn() -> WispMap<K, V>>,
}

impl<K, V> WispMapVisitor<K, V> {
    fn new() -> Self {
        WispMapVisitor {
            marker: PhantomData,
        }
    }
}

impl<'de, K, V> Visitor<'de> for WispMapVisitor<K, V>
where
    K: Deserialize<'de> + Eq + Hash + Send + Sync + 'static,
    V: Deserialize<'de> + Send + Sync + 'static,
{
    type Value = WispMap<K, V>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a WispMap")
    }

    fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
    where
        M: MapAccess<'de>,
    {
        let map = WispMap::with_capacity(access.size_hint().unwrap_or(0));

        while let Some((key, value)) = access.next_entry()? {
            map.insert(key, value);
        }

        Ok(map)
    }
}

impl<'de, K, V> Deserialize<'de> for WispMap<K, V>
where
    K: Deserialize<'de> + Eq + Hash + Send + Sync + 'static,
    V: Deserialize<'de> + Send + Sync + 'static,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(WispMapVisitor::<K, V>::new())
    }
}

impl<K, V, S> Serialize for WispMap<K, V, S>
where
    K: Serialize + Eq + Hash + Send + Sync + 'static,
    V: Serialize + Send + Sync + 'static,
    S: core::hash::BuildHasher,
{
    fn serialize<Se>(&self, serializer: Se) -> Result<Se::Ok, Se::Error>
    where
        Se: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for entry in self.iter() {
            map.serialize_entry(entry.key(), entry.value())?;
        }
        map.end()
    }
}
