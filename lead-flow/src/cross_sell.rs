//! Cross-sell selection for visitors whose primary distribution found no
//! billable match.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::{
    error::{FlowError, Result},
    flow::{Flow, Step},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Brand {
    pub id: i64,
    pub brand_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossSellCategory {
    pub category_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub brands: Vec<Brand>,
}

/// Where cross-sell categories and brand pools come from.
#[async_trait]
pub trait CrossSellSource: Send + Sync {
    async fn category_from_distribution(
        &self,
        distribution_data: &Value,
    ) -> Result<Option<CrossSellCategory>>;

    async fn brands_for_category(&self, category: &CrossSellCategory) -> Result<Option<Vec<Brand>>>;
}

/// Reads the category from the distribution step's `cross_sell` entry and
/// uses the brands listed there as the pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepDataCrossSellSource;

#[async_trait]
impl CrossSellSource for StepDataCrossSellSource {
    async fn category_from_distribution(
        &self,
        distribution_data: &Value,
    ) -> Result<Option<CrossSellCategory>> {
        match distribution_data.get("cross_sell") {
            Some(Value::Null) | None => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_value(raw.clone())?)),
        }
    }

    async fn brands_for_category(&self, category: &CrossSellCategory) -> Result<Option<Vec<Brand>>> {
        if category.brands.is_empty() {
            return Ok(None);
        }
        Ok(Some(category.brands.clone()))
    }
}

pub fn select_brand(brand_id: i64, brands: &[Brand]) -> Option<&Brand> {
    brands.iter().find(|brand| brand.brand_id == brand_id)
}

#[derive(Debug, Clone, PartialEq)]
pub struct CrossSellSelection {
    pub distribution_step: Step,
    pub category: CrossSellCategory,
    pub brands: Vec<Brand>,
    pub brand: Brand,
}

/// Resolve the previous distribution step, its cross-sell category, the
/// category's brand pool and finally `brand_id` within that pool. The first
/// lookup that comes back empty aborts with [`FlowError::NotFound`].
pub async fn select_cross_sell(
    flow: &Flow,
    current_order: i32,
    brand_id: i64,
    source: &dyn CrossSellSource,
) -> Result<CrossSellSelection> {
    let distribution_step = flow
        .previous_distribution_step(current_order)
        .ok_or_else(|| {
            FlowError::NotFound(format!("no distribution step before order {current_order}"))
        })?;

    let category = source
        .category_from_distribution(&distribution_step.data)
        .await?
        .ok_or_else(|| {
            FlowError::NotFound(format!(
                "no cross-sell category for step {}",
                distribution_step.order
            ))
        })?;

    let brands = source
        .brands_for_category(&category)
        .await?
        .ok_or_else(|| {
            FlowError::NotFound(format!(
                "no cross-sell brands for category {}",
                category.category_id
            ))
        })?;

    let brand = select_brand(brand_id, &brands)
        .cloned()
        .ok_or_else(|| FlowError::NotFound(format!("cross-sell brand {brand_id}")))?;

    info!(
        flow_id = flow.id,
        step = current_order,
        category_id = category.category_id,
        brand_id,
        "Cross-sell brand selected"
    );

    Ok(CrossSellSelection {
        distribution_step: distribution_step.clone(),
        category,
        brands,
        brand,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowBuilder, StepType};
    use serde_json::json;

    struct FixedSource {
        category: Option<CrossSellCategory>,
        brands: Option<Vec<Brand>>,
    }

    #[async_trait]
    impl CrossSellSource for FixedSource {
        async fn category_from_distribution(&self, data: &Value) -> Result<Option<CrossSellCategory>> {
            assert_eq!(data, &json!({"a": "b"}));
            Ok(self.category.clone())
        }

        async fn brands_for_category(&self, _: &CrossSellCategory) -> Result<Option<Vec<Brand>>> {
            Ok(self.brands.clone())
        }
    }

    fn brand_a() -> Brand {
        Brand {
            id: 1,
            brand_id: 1,
            name: "A".into(),
        }
    }

    fn category() -> CrossSellCategory {
        CrossSellCategory {
            category_id: 12,
            name: None,
            brands: vec![brand_a()],
        }
    }

    fn flow() -> Flow {
        FlowBuilder::new(1, "f")
            .add_step(Step::new(1, 0, StepType::Question))
            .add_step(Step::new(2, 1, StepType::Distribution).with_data(json!({"a": "b"})))
            .add_step(Step::new(3, 3, StepType::CrossSell))
            .build()
    }

    #[tokio::test]
    async fn test_selection_ok() {
        let source = FixedSource {
            category: Some(category()),
            brands: Some(vec![brand_a()]),
        };

        let selection = select_cross_sell(&flow(), 3, 1, &source).await.unwrap();
        assert_eq!(selection.distribution_step.id, 2);
        assert_eq!(selection.category, category());
        assert_eq!(selection.brands, vec![brand_a()]);
        assert_eq!(selection.brand, brand_a());
    }

    #[tokio::test]
    async fn test_no_previous_distribution_step() {
        let source = FixedSource {
            category: Some(category()),
            brands: Some(vec![brand_a()]),
        };
        let err = select_cross_sell(&flow(), 1, 1, &source).await.unwrap_err();
        assert!(matches!(err, FlowError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_no_category() {
        let source = FixedSource {
            category: None,
            brands: Some(vec![brand_a()]),
        };
        let err = select_cross_sell(&flow(), 3, 1, &source).await.unwrap_err();
        assert!(matches!(err, FlowError::NotFound(ref m) if m.contains("category")));
    }

    #[tokio::test]
    async fn test_no_brands() {
        let source = FixedSource {
            category: Some(category()),
            brands: None,
        };
        let err = select_cross_sell(&flow(), 3, 1, &source).await.unwrap_err();
        assert!(matches!(err, FlowError::NotFound(ref m) if m.contains("brands")));
    }

    #[tokio::test]
    async fn test_no_brand() {
        let source = FixedSource {
            category: Some(category()),
            brands: Some(vec![brand_a()]),
        };
        let err = select_cross_sell(&flow(), 3, 99, &source).await.unwrap_err();
        assert!(matches!(err, FlowError::NotFound(ref m) if m.contains("99")));
    }

    #[tokio::test]
    async fn test_step_data_source() {
        let source = StepDataCrossSellSource;
        let data = json!({"cross_sell": {"category_id": 12, "brands": [{"id": 1, "brand_id": 1, "name": "A"}]}});

        let found = source.category_from_distribution(&data).await.unwrap().unwrap();
        assert_eq!(found, category());
        assert_eq!(source.brands_for_category(&found).await.unwrap(), Some(vec![brand_a()]));

        assert!(source.category_from_distribution(&json!({})).await.unwrap().is_none());
        let empty = CrossSellCategory {
            brands: vec![],
            ..category()
        };
        assert!(source.brands_for_category(&empty).await.unwrap().is_none());
    }
}
